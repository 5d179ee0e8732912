use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;

/// OTel instruments for queues, the scheduler, workers and alerting.
/// Cheap to clone; every component holds its own copy.
#[derive(Clone)]
pub struct Metrics {
    pub messages_enqueued: Counter<u64>,
    pub messages_received: Counter<u64>,
    pub messages_acked: Counter<u64>,
    pub stale_acks: Counter<u64>,
    pub dead_lettered: Counter<u64>,
    pub redriven: Counter<u64>,
    pub queue_depth: Gauge<u64>,
    pub schedule_fires: Counter<u64>,
    pub schedule_failures: Counter<u64>,
    pub worker_failures: Counter<u64>,
    pub alerts_fired: Counter<u64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create metrics from the global meter provider. If no meter provider
    /// is configured (OTel disabled), the instruments are no-op.
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("sluice");
        Self::from_meter(&meter)
    }

    /// Create metrics from a specific meter (used in tests with in-memory exporter).
    pub fn from_meter(meter: &Meter) -> Self {
        Self {
            messages_enqueued: meter
                .u64_counter("sluice.messages.enqueued")
                .with_description("Total messages enqueued")
                .build(),
            messages_received: meter
                .u64_counter("sluice.messages.received")
                .with_description("Total deliveries handed to consumers")
                .build(),
            messages_acked: meter
                .u64_counter("sluice.messages.acked")
                .with_description("Total messages acknowledged")
                .build(),
            stale_acks: meter
                .u64_counter("sluice.messages.stale_acks")
                .with_description("Acknowledgements presented with an expired receipt")
                .build(),
            dead_lettered: meter
                .u64_counter("sluice.messages.dead_lettered")
                .with_description("Messages relocated to a dead-letter queue")
                .build(),
            redriven: meter
                .u64_counter("sluice.messages.redriven")
                .with_description("Dead letters re-injected into their source queue")
                .build(),
            queue_depth: meter
                .u64_gauge("sluice.queue.depth")
                .with_description("Messages stored in the queue, visible or not")
                .build(),
            schedule_fires: meter
                .u64_counter("sluice.schedule.fires")
                .with_description("Schedule rule fires that enqueued a trigger")
                .build(),
            schedule_failures: meter
                .u64_counter("sluice.schedule.failures")
                .with_description("Schedule rule fires whose trigger could not be enqueued")
                .build(),
            worker_failures: meter
                .u64_counter("sluice.worker.failures")
                .with_description("Messages a stage worker failed to process")
                .build(),
            alerts_fired: meter
                .u64_counter("sluice.alerts.fired")
                .with_description("Operator notifications dispatched on OK to ALARM transitions")
                .build(),
        }
    }

    pub fn record_enqueue(&self, queue_id: &str) {
        self.messages_enqueued
            .add(1, &[KeyValue::new("queue_id", queue_id.to_string())]);
    }

    pub fn record_receive(&self, queue_id: &str, count: u64) {
        self.messages_received
            .add(count, &[KeyValue::new("queue_id", queue_id.to_string())]);
    }

    pub fn record_ack(&self, queue_id: &str) {
        self.messages_acked
            .add(1, &[KeyValue::new("queue_id", queue_id.to_string())]);
    }

    pub fn record_stale_ack(&self, queue_id: &str) {
        self.stale_acks
            .add(1, &[KeyValue::new("queue_id", queue_id.to_string())]);
    }

    pub fn record_dead_letter(&self, queue_id: &str) {
        self.dead_lettered
            .add(1, &[KeyValue::new("queue_id", queue_id.to_string())]);
    }

    pub fn record_redrive(&self, queue_id: &str, count: u64) {
        self.redriven
            .add(count, &[KeyValue::new("queue_id", queue_id.to_string())]);
    }

    pub fn set_queue_depth(&self, queue_id: &str, depth: u64) {
        self.queue_depth
            .record(depth, &[KeyValue::new("queue_id", queue_id.to_string())]);
    }

    pub fn record_schedule_fire(&self, rule: &str) {
        self.schedule_fires
            .add(1, &[KeyValue::new("rule", rule.to_string())]);
    }

    pub fn record_schedule_failure(&self, rule: &str) {
        self.schedule_failures
            .add(1, &[KeyValue::new("rule", rule.to_string())]);
    }

    pub fn record_worker_failure(&self, stage: &str) {
        self.worker_failures
            .add(1, &[KeyValue::new("stage", stage.to_string())]);
    }

    pub fn record_alert(&self, alarm: &str) {
        self.alerts_fired
            .add(1, &[KeyValue::new("alarm", alarm.to_string())]);
    }
}
