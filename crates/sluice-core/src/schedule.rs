//! Cron-driven trigger producer.
//!
//! Each fire enqueues exactly one fixed payload on the target queue, whether
//! or not earlier triggers were consumed. A fire that cannot enqueue is not
//! retried; it is reported on its own signal instead.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::alert::{Signal, SignalSender};
use crate::error::ScheduleError;
use crate::metrics::Metrics;
use crate::queue::Queue;

/// Daily at 06:00 UTC.
pub const DEFAULT_CRON: &str = "0 0 6 * * * *";
pub const INGEST_TRIGGER: &str = r#"{"action":"e_ingest"}"#;

/// A parsed cron expression (seconds field first, optional year last).
#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedule: Schedule,
    expression: String,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let schedule = Schedule::from_str(expression).map_err(|e| ScheduleError::InvalidCron {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            schedule,
            expression: expression.to_string(),
        })
    }

    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl std::fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CronSchedule({})", self.expression)
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleRule {
    pub name: String,
    pub schedule: CronSchedule,
    pub target_queue: String,
    pub payload: Vec<u8>,
}

impl ScheduleRule {
    pub fn new(
        name: &str,
        cron: &str,
        target_queue: &str,
        payload: &[u8],
    ) -> Result<Self, ScheduleError> {
        Ok(Self {
            name: name.to_string(),
            schedule: CronSchedule::parse(cron)?,
            target_queue: target_queue.to_string(),
            payload: payload.to_vec(),
        })
    }
}

pub struct Scheduler<Q> {
    rules: Vec<ScheduleRule>,
    targets: HashMap<String, Arc<Q>>,
    skip_if_older_than: Duration,
    metrics: Metrics,
    signals: Option<SignalSender>,
}

impl<Q: Queue> Scheduler<Q> {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            targets: HashMap::new(),
            skip_if_older_than: Duration::from_secs(60 * 60),
            metrics: Metrics::new(),
            signals: None,
        }
    }

    pub fn with_target(mut self, queue: Arc<Q>) -> Self {
        self.targets.insert(queue.name().to_string(), queue);
        self
    }

    /// Add a rule. Its target queue must already be registered.
    pub fn with_rule(mut self, rule: ScheduleRule) -> Result<Self, ScheduleError> {
        if !self.targets.contains_key(&rule.target_queue) {
            return Err(ScheduleError::UnknownTarget(rule.target_queue));
        }
        self.rules.push(rule);
        Ok(self)
    }

    /// Fires scheduled longer ago than this are skipped, not caught up.
    pub fn with_skip_if_older_than(mut self, age: Duration) -> Self {
        self.skip_if_older_than = age;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_signals(mut self, signals: SignalSender) -> Self {
        self.signals = Some(signals);
        self
    }

    pub fn rules(&self) -> &[ScheduleRule] {
        &self.rules
    }

    /// Enqueue one trigger for `rule`, scheduled for `at`.
    pub async fn fire(
        &self,
        rule: &ScheduleRule,
        at: DateTime<Utc>,
    ) -> Result<Uuid, ScheduleError> {
        let result = match self.targets.get(&rule.target_queue) {
            Some(queue) => queue
                .enqueue(rule.payload.clone())
                .await
                .map_err(ScheduleError::from),
            None => Err(ScheduleError::UnknownTarget(rule.target_queue.clone())),
        };

        match &result {
            Ok(id) => {
                self.metrics.record_schedule_fire(&rule.name);
                info!(
                    rule = %rule.name,
                    queue = %rule.target_queue,
                    msg_id = %id,
                    scheduled_at = %at,
                    "schedule fired"
                );
            }
            Err(err) => {
                self.metrics.record_schedule_failure(&rule.name);
                error!(
                    rule = %rule.name,
                    queue = %rule.target_queue,
                    scheduled_at = %at,
                    error = %err,
                    error_code = "schedule_enqueue_failed",
                    "Error creating schedule trigger"
                );
                if let Some(signals) = &self.signals {
                    signals.emit(Signal::ScheduleFailure);
                }
            }
        }
        result
    }

    /// Sleep until rules come due and enqueue them, until `shutdown` flips to
    /// true. Every rule keeps its own next instant, so rules due at the same
    /// instant all fire.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(rules = self.rules.len(), "scheduler started");
        let started = Utc::now();
        let mut upcoming: Vec<Option<DateTime<Utc>>> = self
            .rules
            .iter()
            .map(|rule| rule.schedule.next_after(started))
            .collect();

        loop {
            let Some(next) = upcoming.iter().flatten().min().copied() else {
                warn!("no more scheduled times, stopping scheduler");
                return;
            };
            let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler stopped");
                        return;
                    }
                    continue;
                }
            }

            let now = Utc::now();
            for (rule, slot) in self.rules.iter().zip(upcoming.iter_mut()) {
                let Some(at) = *slot else {
                    continue;
                };
                if at > now {
                    continue;
                }
                let age = (now - at).to_std().unwrap_or(Duration::ZERO);
                if age > self.skip_if_older_than {
                    warn!(
                        rule = %rule.name,
                        scheduled_at = %at,
                        age_secs = age.as_secs(),
                        "skipping stale schedule fire"
                    );
                } else {
                    // Failures are already reported by `fire`; a missed fire is not retried.
                    let _ = self.fire(rule, at).await;
                }
                *slot = rule.schedule.next_after(at);
            }
        }
    }
}

impl<Q: Queue> Default for Scheduler<Q> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::alert::signal_channel;
    use crate::clock::ManualClock;
    use crate::queue::{LeaseQueue, QueueConfig};
    use crate::storage::MemoryStorage;

    fn scraper_queue(max_payload_bytes: usize) -> Arc<LeaseQueue> {
        let mut config = QueueConfig::new("scraper-queue");
        config.max_payload_bytes = max_payload_bytes;
        Arc::new(
            LeaseQueue::open(config, Arc::new(MemoryStorage::new()), Arc::new(ManualClock::new(0)))
                .unwrap(),
        )
    }

    fn every_second(name: &str, payload: &[u8]) -> ScheduleRule {
        ScheduleRule::new(name, "* * * * * * *", "scraper-queue", payload).unwrap()
    }

    fn daily_ingest() -> ScheduleRule {
        ScheduleRule::new("daily-ingest", DEFAULT_CRON, "scraper-queue", INGEST_TRIGGER.as_bytes())
            .unwrap()
    }

    #[test]
    fn parses_seven_field_expressions() {
        let schedule = CronSchedule::parse(DEFAULT_CRON).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 3, 1, 7, 0, 0).unwrap();
        assert_eq!(
            schedule.next_after(after),
            Some(Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap())
        );
        assert!(matches!(
            CronSchedule::parse("every morning"),
            Err(ScheduleError::InvalidCron { .. })
        ));
    }

    #[test]
    fn rule_needs_registered_target() {
        let scheduler: Scheduler<LeaseQueue> = Scheduler::new();
        assert!(matches!(
            scheduler.with_rule(daily_ingest()),
            Err(ScheduleError::UnknownTarget(_))
        ));
    }

    #[tokio::test]
    async fn each_fire_enqueues_one_trigger_regardless_of_backlog() {
        let queue = scraper_queue(1024);
        let scheduler = Scheduler::new()
            .with_target(Arc::clone(&queue))
            .with_rule(daily_ingest())
            .unwrap();
        let rule = scheduler.rules()[0].clone();

        for _ in 0..3 {
            scheduler.fire(&rule, Utc::now()).await.unwrap();
        }
        assert_eq!(queue.stats().unwrap().visible, 3);
        let trigger = queue.try_receive(1).unwrap().remove(0);
        assert_eq!(trigger.payload, INGEST_TRIGGER.as_bytes());
    }

    #[tokio::test]
    async fn failed_fire_is_signalled_not_retried() {
        let queue = scraper_queue(4);
        let (tx, rx) = signal_channel(4);
        let scheduler = Scheduler::new()
            .with_target(Arc::clone(&queue))
            .with_rule(daily_ingest())
            .unwrap()
            .with_signals(tx);
        let rule = scheduler.rules()[0].clone();

        assert!(matches!(
            scheduler.fire(&rule, Utc::now()).await,
            Err(ScheduleError::Enqueue(_))
        ));
        assert_eq!(rx.try_recv().unwrap(), Signal::ScheduleFailure);
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.stats().unwrap().depth(), 0);
    }

    #[tokio::test]
    async fn run_fires_on_schedule_and_stops() {
        let queue = scraper_queue(1024);
        let scheduler = Scheduler::new()
            .with_target(Arc::clone(&queue))
            .with_rule(every_second("every-second", b"{}"))
            .unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(2100)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(queue.stats().unwrap().visible >= 1);
    }

    #[tokio::test]
    async fn rules_due_at_the_same_instant_all_fire() {
        let queue = scraper_queue(1024);
        let scheduler = Scheduler::new()
            .with_target(Arc::clone(&queue))
            .with_rule(every_second("first", b"a"))
            .unwrap()
            .with_rule(every_second("second", b"b"))
            .unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(2100)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        let payloads: Vec<Vec<u8>> = queue
            .try_receive(10)
            .unwrap()
            .into_iter()
            .map(|d| d.payload)
            .collect();
        let firsts = payloads.iter().filter(|p| p.as_slice() == b"a").count();
        let seconds = payloads.iter().filter(|p| p.as_slice() == b"b").count();
        assert!(firsts >= 1);
        assert_eq!(firsts, seconds);
    }
}
