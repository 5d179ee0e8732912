use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::Processor;
use crate::envelope::{actions, ActionRouter, Envelope, Route};
use crate::error::ProcessError;
use crate::message::Delivery;
use crate::queue::Queue;

/// Parameters of one ingestion run, taken from the trigger payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
    #[serde(default)]
    pub offset: u64,
    #[serde(default = "default_days")]
    pub date_since_days: u32,
}

fn default_days() -> u32 {
    1
}

impl Default for IngestRequest {
    fn default() -> Self {
        Self {
            offset: 0,
            date_since_days: default_days(),
        }
    }
}

/// Documents touched by one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    /// Documents seen for the first time.
    #[serde(default)]
    pub new: Vec<String>,
    /// Documents whose text changed; earlier analysis is stale.
    #[serde(default)]
    pub revised: Vec<String>,
    /// Documents with only status changes; no analysis needed.
    #[serde(default)]
    pub propagated: Vec<String>,
}

impl IngestReport {
    /// NLP work items: one for new documents, one for revised ones.
    pub fn downstream(&self) -> Vec<Envelope> {
        let mut items = Vec::new();
        if !self.new.is_empty() {
            items.push(Envelope::new(
                actions::EVENT_EXTRACTOR,
                json!({ "ids": self.new, "type": "new_bill" }),
            ));
        }
        if !self.revised.is_empty() {
            items.push(Envelope::new(
                actions::EVENT_EXTRACTOR,
                json!({ "ids": self.revised, "type": "updated_bill" }),
            ));
        }
        items
    }
}

/// Fetches and stores source documents. Must be idempotent: a redelivered
/// trigger runs it again.
pub trait Ingestor: Send + Sync {
    fn ingest(
        &self,
        request: &IngestRequest,
    ) -> impl Future<Output = Result<IngestReport, ProcessError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScraperAction {
    Ingest,
}

/// First stage: turns schedule triggers into NLP work items.
pub struct ScraperStage<I, Q> {
    ingestor: I,
    downstream: Arc<Q>,
    router: ActionRouter<ScraperAction>,
}

impl<I: Ingestor, Q: Queue> ScraperStage<I, Q> {
    pub fn new(ingestor: I, downstream: Arc<Q>) -> Self {
        Self {
            ingestor,
            downstream,
            router: ActionRouter::new().with(actions::INGEST, ScraperAction::Ingest),
        }
    }

    async fn ingest(&self, envelope: &Envelope) -> Result<(), ProcessError> {
        let request: IngestRequest = envelope.payload_as()?;
        info!(
            offset = request.offset,
            date_since_days = request.date_since_days,
            "ingestion started"
        );

        let report = self.ingestor.ingest(&request).await?;
        info!(
            new = report.new.len(),
            revised = report.revised.len(),
            propagated = report.propagated.len(),
            "ingestion finished"
        );

        // Downstream items go out before the trigger is acknowledged.
        for item in report.downstream() {
            let id = self.downstream.enqueue(item.to_bytes()).await?;
            info!(queue = self.downstream.name(), msg_id = %id, "work item enqueued");
        }
        Ok(())
    }
}

impl<I: Ingestor, Q: Queue> Processor for ScraperStage<I, Q> {
    fn stage(&self) -> &str {
        "scraper"
    }

    async fn process(&self, delivery: &Delivery) -> Result<(), ProcessError> {
        let envelope = Envelope::parse(&delivery.payload)?;
        match self.router.route(&envelope) {
            Route::Handle(ScraperAction::Ingest) => self.ingest(&envelope).await,
            Route::Unsupported(action) => {
                warn!(stage = "scraper", action = %action, "Unsupported action");
                Ok(())
            }
        }
    }
}
