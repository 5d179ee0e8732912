use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::Processor;
use crate::envelope::{actions, ActionRouter, Envelope, Route};
use crate::error::{ProcessError, StorageError, StorageResult};
use crate::message::Delivery;
use crate::queue::Queue;
use crate::storage::{keys, Storage, WriteBatchOp};

/// How long to wait before checking on a submitted analysis batch.
pub const DEFAULT_FOLLOW_UP_DELAY: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    #[default]
    NewBill,
    UpdatedBill,
}

/// `e_event_extractor` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractRequest {
    pub ids: Vec<String>,
    #[serde(rename = "type", default)]
    pub kind: UpdateKind,
}

/// `e_event_retriever` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrieveRequest {
    pub batch_id: String,
    #[serde(default)]
    pub bill_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failed,
}

/// Analysis result for one document, keyed by its natural id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub key: String,
    pub status: OutcomeStatus,
    #[serde(default)]
    pub record: Value,
    #[serde(default)]
    pub error: Option<String>,
}

/// What an analyzer reports back for one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    /// Finished documents. Failed ones are resubmitted for extraction.
    #[serde(default)]
    pub outcomes: Vec<AnalysisOutcome>,
    /// Set when results are not ready yet; the stage schedules a check.
    #[serde(default)]
    pub pending_batch: Option<String>,
}

/// A downstream item enqueued on the NLP queue before the ack.
#[derive(Debug, Clone, PartialEq)]
pub struct FollowUp {
    pub envelope: Envelope,
    pub delay: Duration,
}

/// The opaque analysis engine.
pub trait Analyzer: Send + Sync {
    /// Start analysis of a batch of documents.
    fn extract(
        &self,
        request: &ExtractRequest,
    ) -> impl Future<Output = Result<Analysis, ProcessError>> + Send;

    /// Collect the results of an earlier `extract`.
    fn retrieve(
        &self,
        request: &RetrieveRequest,
    ) -> impl Future<Output = Result<Analysis, ProcessError>> + Send;
}

/// Durable sink for analysis results. `upsert` by natural key is what makes
/// redelivered work harmless.
pub trait ResultStore: Send + Sync {
    fn upsert(&self, key: &str, record: &Value) -> StorageResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryResultStore {
    records: Mutex<HashMap<String, Value>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.records.lock().ok()?.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResultStore for MemoryResultStore {
    fn upsert(&self, key: &str, record: &Value) -> StorageResult<()> {
        self.records
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?
            .insert(key.to_string(), record.clone());
        Ok(())
    }
}

impl<T: ResultStore + ?Sized> ResultStore for Arc<T> {
    fn upsert(&self, key: &str, record: &Value) -> StorageResult<()> {
        (**self).upsert(key, record)
    }
}

/// Results kept in the `state` column family next to the queues.
pub struct StorageResultStore {
    storage: Arc<dyn Storage>,
}

impl StorageResultStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        match self.storage.get_state(&keys::result_key(key))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl ResultStore for StorageResultStore {
    fn upsert(&self, key: &str, record: &Value) -> StorageResult<()> {
        self.storage.write_batch(vec![WriteBatchOp::PutState {
            key: keys::result_key(key),
            value: serde_json::to_vec(record)?,
        }])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NlpAction {
    Extract,
    Retrieve,
}

/// Second stage: analysis and result commit. No downstream queue of its own,
/// only follow-ups back onto the NLP queue.
pub struct NlpStage<A, Q, S> {
    analyzer: A,
    queue: Arc<Q>,
    results: S,
    follow_up_delay: Duration,
    router: ActionRouter<NlpAction>,
}

impl<A: Analyzer, Q: Queue, S: ResultStore> NlpStage<A, Q, S> {
    pub fn new(analyzer: A, queue: Arc<Q>, results: S) -> Self {
        Self {
            analyzer,
            queue,
            results,
            follow_up_delay: DEFAULT_FOLLOW_UP_DELAY,
            router: ActionRouter::new()
                .with(actions::EVENT_EXTRACTOR, NlpAction::Extract)
                .with(actions::EVENT_RETRIEVER, NlpAction::Retrieve),
        }
    }

    pub fn with_follow_up_delay(mut self, delay: Duration) -> Self {
        self.follow_up_delay = delay;
        self
    }

    async fn extract(&self, envelope: &Envelope) -> Result<(), ProcessError> {
        let request: ExtractRequest = envelope.payload_as()?;
        if request.kind == UpdateKind::UpdatedBill {
            // Revised documents start over with no results.
            for id in &request.ids {
                self.results.upsert(id, &json!({ "events": [] }))?;
            }
        }
        info!(count = request.ids.len(), kind = ?request.kind, "extraction requested");

        let analysis = self.analyzer.extract(&request).await?;
        self.complete(analysis, &request.ids).await
    }

    async fn retrieve(&self, envelope: &Envelope) -> Result<(), ProcessError> {
        let request: RetrieveRequest = envelope.payload_as()?;
        info!(batch_id = %request.batch_id, "checking analysis batch");

        let analysis = self.analyzer.retrieve(&request).await?;
        self.complete(analysis, &request.bill_ids).await
    }

    /// Commit finished outcomes, then enqueue every follow-up.
    async fn complete(&self, analysis: Analysis, ids: &[String]) -> Result<(), ProcessError> {
        let mut retry = Vec::new();
        let mut committed = 0usize;
        for outcome in &analysis.outcomes {
            match outcome.status {
                OutcomeStatus::Success => {
                    self.results.upsert(&outcome.key, &outcome.record)?;
                    committed += 1;
                }
                OutcomeStatus::Failed => {
                    warn!(
                        key = %outcome.key,
                        error = outcome.error.as_deref().unwrap_or("unknown"),
                        "analysis failed, resubmitting"
                    );
                    retry.push(outcome.key.clone());
                }
            }
        }
        if committed > 0 {
            info!(count = committed, "results committed");
        }

        for follow_up in self.follow_ups(&analysis, ids, retry) {
            if let Err(err) = self
                .queue
                .enqueue_delayed(follow_up.envelope.to_bytes(), follow_up.delay)
                .await
            {
                error!(
                    action = %follow_up.envelope.action,
                    error = %err,
                    error_code = "follow_up_enqueue_failed",
                    "Error creating follow-up check"
                );
                return Err(err.into());
            }
        }
        Ok(())
    }

    fn follow_ups(&self, analysis: &Analysis, ids: &[String], retry: Vec<String>) -> Vec<FollowUp> {
        let mut follow_ups = Vec::new();
        if let Some(batch_id) = &analysis.pending_batch {
            follow_ups.push(FollowUp {
                envelope: Envelope::new(
                    actions::EVENT_RETRIEVER,
                    json!({ "batch_id": batch_id, "bill_ids": ids }),
                ),
                delay: self.follow_up_delay,
            });
        }
        if !retry.is_empty() {
            follow_ups.push(FollowUp {
                envelope: Envelope::new(
                    actions::EVENT_EXTRACTOR,
                    json!({ "ids": retry, "type": "new_bill" }),
                ),
                delay: Duration::ZERO,
            });
        }
        follow_ups
    }
}

impl<A: Analyzer, Q: Queue, S: ResultStore> Processor for NlpStage<A, Q, S> {
    fn stage(&self) -> &str {
        "nlp"
    }

    async fn process(&self, delivery: &Delivery) -> Result<(), ProcessError> {
        let envelope = Envelope::parse(&delivery.payload)?;
        match self.router.route(&envelope) {
            Route::Handle(NlpAction::Extract) => self.extract(&envelope).await,
            Route::Handle(NlpAction::Retrieve) => self.retrieve(&envelope).await,
            Route::Unsupported(action) => {
                warn!(stage = "nlp", action = %action, "Unsupported action");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::message::ReceiptHandle;
    use crate::queue::{LeaseQueue, QueueConfig};
    use crate::storage::MemoryStorage;

    /// Extraction always goes pending; retrieval succeeds for every id except
    /// those listed in `failing`.
    struct BatchAnalyzer {
        failing: Vec<String>,
    }

    impl Analyzer for BatchAnalyzer {
        async fn extract(&self, request: &ExtractRequest) -> Result<Analysis, ProcessError> {
            if request.ids.is_empty() {
                return Err(ProcessError::Handler("No valid bills found for processing".into()));
            }
            Ok(Analysis {
                outcomes: Vec::new(),
                pending_batch: Some("batch-1".to_string()),
            })
        }

        async fn retrieve(&self, request: &RetrieveRequest) -> Result<Analysis, ProcessError> {
            let outcomes = request
                .bill_ids
                .iter()
                .map(|id| {
                    let failed = self.failing.contains(id);
                    AnalysisOutcome {
                        key: id.clone(),
                        status: if failed { OutcomeStatus::Failed } else { OutcomeStatus::Success },
                        record: json!({ "events": [{ "title": format!("event of {id}") }] }),
                        error: failed.then(|| "model refused".to_string()),
                    }
                })
                .collect();
            Ok(Analysis {
                outcomes,
                pending_batch: None,
            })
        }
    }

    struct Fixture {
        stage: NlpStage<BatchAnalyzer, LeaseQueue, Arc<MemoryResultStore>>,
        queue: Arc<LeaseQueue>,
        results: Arc<MemoryResultStore>,
        clock: ManualClock,
    }

    fn fixture(failing: &[&str]) -> Fixture {
        let clock = ManualClock::new(0);
        let queue = Arc::new(
            LeaseQueue::open(
                QueueConfig::new("nlp-queue").with_max_receive_count(2),
                Arc::new(MemoryStorage::new()),
                Arc::new(clock.clone()),
            )
            .unwrap(),
        );
        let results = Arc::new(MemoryResultStore::new());
        let analyzer = BatchAnalyzer {
            failing: failing.iter().map(|s| s.to_string()).collect(),
        };
        let stage = NlpStage::new(analyzer, Arc::clone(&queue), Arc::clone(&results));
        Fixture {
            stage,
            queue,
            results,
            clock,
        }
    }

    fn delivery(envelope: &Envelope) -> Delivery {
        Delivery {
            message_id: uuid::Uuid::now_v7(),
            receipt: ReceiptHandle {
                queue_id: "nlp-queue".to_string(),
                enqueued_at: 0,
                message_id: uuid::Uuid::now_v7(),
                nonce: uuid::Uuid::now_v7(),
            },
            payload: envelope.to_bytes(),
            delivery_count: 1,
            enqueued_at: 0,
        }
    }

    #[test]
    fn extract_request_type_defaults_to_new() {
        let request: ExtractRequest = serde_json::from_value(json!({"ids": ["HR1-119"]})).unwrap();
        assert_eq!(request.kind, UpdateKind::NewBill);
        let request: ExtractRequest =
            serde_json::from_value(json!({"ids": [], "type": "updated_bill"})).unwrap();
        assert_eq!(request.kind, UpdateKind::UpdatedBill);
    }

    #[tokio::test]
    async fn extract_schedules_delayed_check() {
        let f = fixture(&[]);
        let envelope = Envelope::new(actions::EVENT_EXTRACTOR, json!({"ids": ["HR1-119"]}));
        f.stage.process(&delivery(&envelope)).await.unwrap();

        assert!(f.queue.try_receive(1).unwrap().is_empty(), "check is delayed");
        assert_eq!(f.queue.stats().unwrap().delayed, 1);

        f.clock.advance(DEFAULT_FOLLOW_UP_DELAY);
        let check = f.queue.try_receive(1).unwrap().remove(0);
        let check = Envelope::parse(&check.payload).unwrap();
        assert_eq!(check.action, actions::EVENT_RETRIEVER);
        assert_eq!(check.payload, json!({"batch_id": "batch-1", "bill_ids": ["HR1-119"]}));
    }

    #[tokio::test]
    async fn revised_documents_are_reset_before_extraction() {
        let f = fixture(&[]);
        f.results.upsert("S5-119", &json!({"events": [1, 2, 3]})).unwrap();
        let envelope = Envelope::new(
            actions::EVENT_EXTRACTOR,
            json!({"ids": ["S5-119"], "type": "updated_bill"}),
        );
        f.stage.process(&delivery(&envelope)).await.unwrap();
        assert_eq!(f.results.get("S5-119"), Some(json!({"events": []})));
    }

    #[tokio::test]
    async fn retrieve_commits_and_resubmits_failures() {
        let f = fixture(&["S6-119"]);
        let envelope = Envelope::new(
            actions::EVENT_RETRIEVER,
            json!({"batch_id": "batch-1", "bill_ids": ["S5-119", "S6-119"]}),
        );
        f.stage.process(&delivery(&envelope)).await.unwrap();

        assert!(f.results.get("S5-119").is_some());
        assert!(f.results.get("S6-119").is_none());

        let retry = f.queue.try_receive(1).unwrap().remove(0);
        let retry = Envelope::parse(&retry.payload).unwrap();
        assert_eq!(retry.action, actions::EVENT_EXTRACTOR);
        assert_eq!(retry.payload, json!({"ids": ["S6-119"], "type": "new_bill"}));
    }

    #[tokio::test]
    async fn redelivered_results_are_upserted_not_duplicated() {
        let f = fixture(&[]);
        let envelope = Envelope::new(
            actions::EVENT_RETRIEVER,
            json!({"batch_id": "batch-1", "bill_ids": ["S5-119"]}),
        );
        f.stage.process(&delivery(&envelope)).await.unwrap();
        f.stage.process(&delivery(&envelope)).await.unwrap();
        assert_eq!(f.results.len(), 1);
    }

    #[tokio::test]
    async fn analyzer_failure_fails_the_message() {
        let f = fixture(&[]);
        let envelope = Envelope::new(actions::EVENT_EXTRACTOR, json!({"ids": []}));
        assert!(matches!(
            f.stage.process(&delivery(&envelope)).await,
            Err(ProcessError::Handler(_))
        ));
        assert_eq!(f.queue.stats().unwrap().depth(), 0);
    }

    #[tokio::test]
    async fn follow_up_enqueue_failure_fails_the_message() {
        let f = fixture(&[]);
        let mut ids = Vec::new();
        // Enough ids to push the follow-up past the payload limit.
        for i in 0..40_000 {
            ids.push(format!("HR{i}-119"));
        }
        let envelope = Envelope::new(actions::EVENT_EXTRACTOR, json!({ "ids": ids }));
        assert!(matches!(
            f.stage.process(&delivery(&envelope)).await,
            Err(ProcessError::Downstream(_))
        ));
    }

    #[test]
    fn storage_result_store_round_trips() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let store = StorageResultStore::new(Arc::clone(&storage));
        store.upsert("HR1-119", &json!({"events": []})).unwrap();
        store.upsert("HR1-119", &json!({"events": [{"title": "x"}]})).unwrap();
        assert_eq!(
            store.get("HR1-119").unwrap(),
            Some(json!({"events": [{"title": "x"}]}))
        );
        assert_eq!(store.get("HR2-119").unwrap(), None);
    }
}
