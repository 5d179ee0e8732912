//! Edge-triggered operator alerting.
//!
//! Components report [`Signal`]s over a bounded crossbeam channel. The
//! [`AlertSink`] turns them into windowed observations, evaluates every
//! [`Alarm`] on each tick, and notifies once per `Ok -> Alarm` transition.

mod layer;

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::clock::{duration_ns, Clock};
use crate::metrics::Metrics;

pub use layer::{ErrorPatternLayer, DEFAULT_PATTERNS};

pub const DEAD_LETTERS: &str = "dead_letters";
pub const WORKER_ERRORS: &str = "worker_errors";
pub const SCHEDULE_FAILURES: &str = "schedule_failures";

/// Something an operator may need to hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    DeadLettered { queue: String },
    LogMatch { pattern: String },
    WorkerError { stage: String },
    ScheduleFailure,
}

impl Signal {
    /// The alarm metric this signal feeds. Log matches get one metric per
    /// pattern so each pattern alarms independently.
    pub fn metric_name(&self) -> String {
        match self {
            Signal::DeadLettered { .. } => DEAD_LETTERS.to_string(),
            Signal::LogMatch { pattern } => log_match_metric(pattern),
            Signal::WorkerError { .. } => WORKER_ERRORS.to_string(),
            Signal::ScheduleFailure => SCHEDULE_FAILURES.to_string(),
        }
    }
}

pub fn log_match_metric(pattern: &str) -> String {
    format!("log_match:{pattern}")
}

/// Cloneable, non-blocking handle for reporting signals.
///
/// Signals are dropped when the channel is full or the sink is gone; alerting
/// must never stall the component that reports.
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: Sender<Signal>,
}

impl SignalSender {
    pub fn emit(&self, signal: Signal) {
        // No logging here: the pattern layer reports through this sender.
        let _ = self.tx.try_send(signal);
    }
}

pub fn signal_channel(capacity: usize) -> (SignalSender, Receiver<Signal>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (SignalSender { tx }, rx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    GreaterThanOrEqual,
    GreaterThan,
    LessThan,
    LessThanOrEqual,
}

impl Comparison {
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::GreaterThanOrEqual => value >= threshold,
            Comparison::GreaterThan => value > threshold,
            Comparison::LessThan => value < threshold,
            Comparison::LessThanOrEqual => value <= threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlarmRule {
    pub name: String,
    pub metric_name: String,
    pub threshold: f64,
    pub evaluation_window: Duration,
    pub comparison: Comparison,
}

impl AlarmRule {
    /// One `>= threshold` rule per built-in signal plus one per log pattern.
    pub fn defaults(threshold: f64, window: Duration, patterns: &[String]) -> Vec<AlarmRule> {
        let metrics = [DEAD_LETTERS, WORKER_ERRORS, SCHEDULE_FAILURES]
            .into_iter()
            .map(str::to_string)
            .chain(patterns.iter().map(|p| log_match_metric(p)));
        metrics
            .map(|metric_name| AlarmRule {
                name: format!("{metric_name} alarm"),
                metric_name,
                threshold,
                evaluation_window: window,
                comparison: Comparison::GreaterThanOrEqual,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlarmState {
    #[default]
    Ok,
    Alarm,
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlarmState::Ok => f.write_str("OK"),
            AlarmState::Alarm => f.write_str("ALARM"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Raised,
    Cleared,
}

/// Two-state machine over a rolling sum of observations.
#[derive(Debug)]
pub struct Alarm {
    rule: AlarmRule,
    state: AlarmState,
    window: VecDeque<(u64, f64)>,
}

impl Alarm {
    pub fn new(rule: AlarmRule) -> Self {
        Self {
            rule,
            state: AlarmState::Ok,
            window: VecDeque::new(),
        }
    }

    pub fn rule(&self) -> &AlarmRule {
        &self.rule
    }

    pub fn state(&self) -> AlarmState {
        self.state
    }

    pub fn observe(&mut self, at_ns: u64, value: f64) {
        self.window.push_back((at_ns, value));
    }

    /// Sum of observations inside `(now - window, now]`.
    pub fn windowed_value(&mut self, now_ns: u64) -> f64 {
        let start = now_ns.saturating_sub(duration_ns(self.rule.evaluation_window));
        while self.window.front().is_some_and(|(at, _)| *at <= start) {
            self.window.pop_front();
        }
        self.window
            .iter()
            .filter(|(at, _)| *at <= now_ns)
            .map(|(_, v)| v)
            .sum()
    }

    /// Re-evaluate the window. Returns a transition only when the state changes.
    pub fn evaluate(&mut self, now_ns: u64) -> Option<Transition> {
        let value = self.windowed_value(now_ns);
        let breached = self.rule.comparison.holds(value, self.rule.threshold);
        match (self.state, breached) {
            (AlarmState::Ok, true) => {
                self.state = AlarmState::Alarm;
                Some(Transition::Raised)
            }
            (AlarmState::Alarm, false) => {
                self.state = AlarmState::Ok;
                Some(Transition::Cleared)
            }
            _ => None,
        }
    }
}

/// One operator notification, sent on `Ok -> Alarm`.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub alarm: String,
    pub metric_name: String,
    pub value: f64,
    pub threshold: f64,
    pub at_ns: u64,
}

/// The operator channel.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, n: &Notification) {
        warn!(
            alarm = %n.alarm,
            metric = %n.metric_name,
            value = n.value,
            threshold = n.threshold,
            "alarm raised"
        );
    }
}

/// Keeps every notification in memory. Clones share the same list.
#[derive(Debug, Default, Clone)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &Notification) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification.clone());
        }
    }
}

pub struct AlertSink {
    signals: Receiver<Signal>,
    alarms: Vec<Alarm>,
    notifier: Box<dyn Notifier>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
}

impl AlertSink {
    pub fn new(
        signals: Receiver<Signal>,
        notifier: Box<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            signals,
            alarms: Vec::new(),
            notifier,
            clock,
            metrics: Metrics::new(),
        }
    }

    pub fn with_rules(mut self, rules: impl IntoIterator<Item = AlarmRule>) -> Self {
        self.alarms.extend(rules.into_iter().map(Alarm::new));
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn alarms(&self) -> &[Alarm] {
        &self.alarms
    }

    /// Record one observation for every alarm watching the signal's metric.
    pub fn record(&mut self, signal: &Signal, at_ns: u64) {
        let metric = signal.metric_name();
        for alarm in self.alarms.iter_mut().filter(|a| a.rule.metric_name == metric) {
            alarm.observe(at_ns, 1.0);
        }
    }

    /// Record every pending signal at `at_ns`. Returns how many were pending.
    pub fn drain(&mut self, at_ns: u64) -> usize {
        let pending: Vec<Signal> = self.signals.try_iter().collect();
        for signal in &pending {
            self.record(signal, at_ns);
        }
        pending.len()
    }

    /// Drain pending signals, evaluate every alarm, and notify on each
    /// `Ok -> Alarm` transition. Returns the notifications sent.
    pub fn tick(&mut self, now_ns: u64) -> Vec<Notification> {
        self.drain(now_ns);

        let mut sent = Vec::new();
        for alarm in &mut self.alarms {
            let value = alarm.windowed_value(now_ns);
            match alarm.evaluate(now_ns) {
                Some(Transition::Raised) => {
                    let notification = Notification {
                        alarm: alarm.rule.name.clone(),
                        metric_name: alarm.rule.metric_name.clone(),
                        value,
                        threshold: alarm.rule.threshold,
                        at_ns: now_ns,
                    };
                    self.notifier.notify(&notification);
                    self.metrics.record_alert(&alarm.rule.name);
                    sent.push(notification);
                }
                Some(Transition::Cleared) => {
                    info!(alarm = %alarm.rule.name, value, "alarm returned to OK");
                }
                None => {}
            }
        }
        sent
    }

    /// Tick every `interval` until `shutdown` flips to true.
    pub async fn run(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = self.clock.now_ns();
                    self.tick(now);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(alarms = self.alarms.len(), "alert sink stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const MINUTE: Duration = Duration::from_secs(60);
    const MINUTE_NS: u64 = 60_000_000_000;

    fn rule(metric: &str, threshold: f64, comparison: Comparison) -> AlarmRule {
        AlarmRule {
            name: format!("{metric} alarm"),
            metric_name: metric.to_string(),
            threshold,
            evaluation_window: MINUTE,
            comparison,
        }
    }

    fn sink(rules: Vec<AlarmRule>) -> (AlertSink, SignalSender, RecordingNotifier) {
        let (tx, rx) = signal_channel(64);
        let notifier = RecordingNotifier::new();
        let sink = AlertSink::new(rx, Box::new(notifier.clone()), Arc::new(ManualClock::new(0)))
            .with_rules(rules);
        (sink, tx, notifier)
    }

    #[test]
    fn comparisons() {
        assert!(Comparison::GreaterThanOrEqual.holds(1.0, 1.0));
        assert!(!Comparison::GreaterThan.holds(1.0, 1.0));
        assert!(Comparison::LessThan.holds(0.0, 1.0));
        assert!(Comparison::LessThanOrEqual.holds(1.0, 1.0));
    }

    #[test]
    fn alarm_is_edge_triggered() {
        let mut alarm = Alarm::new(rule(WORKER_ERRORS, 2.0, Comparison::GreaterThanOrEqual));
        alarm.observe(10, 1.0);
        assert_eq!(alarm.evaluate(10), None);
        alarm.observe(20, 1.0);
        assert_eq!(alarm.evaluate(20), Some(Transition::Raised));
        alarm.observe(30, 1.0);
        assert_eq!(alarm.evaluate(30), None);
        assert_eq!(alarm.state(), AlarmState::Alarm);

        assert_eq!(alarm.evaluate(30 + MINUTE_NS), Some(Transition::Cleared));
        assert_eq!(alarm.state(), AlarmState::Ok);
    }

    #[test]
    fn window_drops_old_observations() {
        let mut alarm = Alarm::new(rule(DEAD_LETTERS, 1.0, Comparison::GreaterThanOrEqual));
        let second = 1_000_000_000;
        alarm.observe(10 * second, 1.0);
        alarm.observe(40 * second, 1.0);
        assert_eq!(alarm.windowed_value(40 * second), 2.0);
        assert_eq!(alarm.windowed_value(70 * second), 1.0);
        assert_eq!(alarm.windowed_value(100 * second), 0.0);
    }

    #[test]
    fn one_notification_per_breach_episode() {
        let (mut sink, tx, notifier) = sink(vec![rule(
            WORKER_ERRORS,
            1.0,
            Comparison::GreaterThanOrEqual,
        )]);
        let stage = || Signal::WorkerError {
            stage: "nlp".to_string(),
        };

        let mut now = MINUTE_NS;
        tx.emit(stage());
        assert_eq!(sink.tick(now).len(), 1);

        for _ in 0..5 {
            now += MINUTE_NS;
            tx.emit(stage());
            assert!(sink.tick(now).is_empty());
        }
        assert_eq!(notifier.notifications().len(), 1);

        now += MINUTE_NS;
        assert!(sink.tick(now).is_empty());
        assert_eq!(sink.alarms()[0].state(), AlarmState::Ok);

        now += MINUTE_NS;
        tx.emit(stage());
        assert_eq!(sink.tick(now).len(), 1);
        assert_eq!(notifier.notifications().len(), 2);
    }

    #[test]
    fn signals_only_feed_matching_alarms() {
        let (mut sink, tx, notifier) = sink(AlarmRule::defaults(
            1.0,
            MINUTE,
            &["Error".to_string()],
        ));
        tx.emit(Signal::DeadLettered {
            queue: "nlp-queue".to_string(),
        });
        let sent = sink.tick(1);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].metric_name, DEAD_LETTERS);
        assert_eq!(sent[0].value, 1.0);

        tx.emit(Signal::LogMatch {
            pattern: "Error".to_string(),
        });
        let sent = sink.tick(2);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].metric_name, "log_match:Error");
        assert_eq!(notifier.notifications().len(), 2);
    }

    #[test]
    fn emit_never_blocks_when_full() {
        let (tx, rx) = signal_channel(1);
        tx.emit(Signal::ScheduleFailure);
        tx.emit(Signal::ScheduleFailure);
        assert_eq!(rx.try_iter().count(), 1);
        drop(rx);
        tx.emit(Signal::ScheduleFailure);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (sink, _tx, _notifier) = sink(Vec::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(sink.run(Duration::from_millis(5), shutdown_rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
