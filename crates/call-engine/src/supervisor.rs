//! Connection-health supervision: disconnect grace, watchdog
//! escalation, bounded restarts, and the packet-loss quality meter.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CallConfig;
use crate::events::LinkQuality;
use crate::media::{ConnectionState, TransportSample};

/// Why a deadline was armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escalation {
    Grace,
    Watchdog,
}

/// What the driver loop must do after a supervisor poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    None,
    /// Run one negotiation restart.
    Restart,
    /// The restart budget is spent; land in failed.
    GiveUp,
}

/// Decides when a session restarts. Pure state machine over instants;
/// the driver loop owns the actual timer and reports expiries back via
/// [`ReconnectionSupervisor::on_deadline`].
pub struct ReconnectionSupervisor {
    disconnect_grace: Duration,
    connect_timeout: Duration,
    max_restart_attempts: u32,
    attempts: u32,
    deadline: Option<(Instant, Escalation)>,
}

impl ReconnectionSupervisor {
    pub fn new(config: &CallConfig) -> Self {
        Self {
            disconnect_grace: config.disconnect_grace,
            connect_timeout: config.connect_timeout,
            max_restart_attempts: config.max_restart_attempts,
            attempts: 0,
            deadline: None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Instant the driver loop should wake at, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.map(|(at, _)| at)
    }

    /// Arms the watchdog for a fresh negotiation round.
    pub fn negotiation_started(&mut self, now: Instant) {
        self.deadline = Some((now + self.connect_timeout, Escalation::Watchdog));
    }

    /// Connection-state report. `Disconnected` arms the grace timer,
    /// `Failed` escalates immediately, `Connected` clears any pending
    /// deadline and resets the attempt budget for the next outage.
    pub fn on_connection_state(&mut self, state: ConnectionState, now: Instant) -> SupervisorAction {
        match state {
            ConnectionState::Connected => {
                self.deadline = None;
                if self.attempts > 0 {
                    debug!(attempts = self.attempts, "connection recovered, attempt budget reset");
                }
                self.attempts = 0;
                SupervisorAction::None
            }
            ConnectionState::Disconnected => {
                // an armed watchdog already covers the outage
                if self.deadline.is_none() {
                    self.deadline = Some((now + self.disconnect_grace, Escalation::Grace));
                    debug!(grace_ms = self.disconnect_grace.as_millis() as u64, "disconnect grace armed");
                }
                SupervisorAction::None
            }
            ConnectionState::Failed => self.escalate(now),
            ConnectionState::Closed => {
                self.deadline = None;
                SupervisorAction::None
            }
            _ => SupervisorAction::None,
        }
    }

    /// A timer armed from [`ReconnectionSupervisor::deadline`] fired.
    pub fn on_deadline(&mut self, now: Instant) -> SupervisorAction {
        match self.deadline.take() {
            Some((at, escalation)) if at <= now => {
                match escalation {
                    Escalation::Grace => debug!("disconnect grace expired"),
                    Escalation::Watchdog => warn!("negotiation watchdog expired"),
                }
                self.escalate(now)
            }
            other => {
                // spurious wake; keep the pending deadline
                self.deadline = other;
                SupervisorAction::None
            }
        }
    }

    fn escalate(&mut self, now: Instant) -> SupervisorAction {
        if self.attempts >= self.max_restart_attempts {
            self.deadline = None;
            warn!(attempts = self.attempts, "restart attempts exhausted");
            return SupervisorAction::GiveUp;
        }
        self.attempts += 1;
        // exactly one restart per expiry; the new round gets a fresh
        // watchdog window
        self.deadline = Some((now + self.connect_timeout, Escalation::Watchdog));
        debug!(
            attempt = self.attempts,
            max = self.max_restart_attempts,
            "restart scheduled"
        );
        SupervisorAction::Restart
    }
}

const GOOD_LOSS_MAX: f64 = 0.02;
const MEDIUM_LOSS_MAX: f64 = 0.08;
const LOSS_EMA_WEIGHT: f64 = 0.3;

/// Classifies packet loss into coarse quality classes. Cumulative
/// counters are diffed per interval and smoothed with an EMA so one
/// bad sample does not flap the class.
pub struct QualityMeter {
    prev_sent: u64,
    prev_lost: i64,
    loss_ema: f64,
    current: Option<LinkQuality>,
}

impl QualityMeter {
    pub fn new() -> Self {
        Self {
            prev_sent: 0,
            prev_lost: 0,
            loss_ema: 0.0,
            current: None,
        }
    }

    pub fn current(&self) -> Option<LinkQuality> {
        self.current
    }

    /// Feeds one sample; returns the class only when it changes.
    pub fn record(&mut self, sample: TransportSample) -> Option<LinkQuality> {
        let interval_sent = sample.packets_sent.saturating_sub(self.prev_sent);
        let interval_lost = sample.packets_lost.saturating_sub(self.prev_lost).max(0) as f64;
        self.prev_sent = sample.packets_sent;
        self.prev_lost = sample.packets_lost;
        if interval_sent == 0 {
            return None;
        }
        let loss_rate = interval_lost / interval_sent as f64;
        self.loss_ema = self.loss_ema * (1.0 - LOSS_EMA_WEIGHT) + loss_rate * LOSS_EMA_WEIGHT;

        let class = if self.loss_ema < GOOD_LOSS_MAX {
            LinkQuality::Good
        } else if self.loss_ema < MEDIUM_LOSS_MAX {
            LinkQuality::Medium
        } else {
            LinkQuality::Poor
        };
        if self.current == Some(class) {
            return None;
        }
        self.current = Some(class);
        Some(class)
    }
}

impl Default for QualityMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(grace_ms: u64, timeout_ms: u64, max_attempts: u32) -> CallConfig {
        CallConfig {
            disconnect_grace: Duration::from_millis(grace_ms),
            connect_timeout: Duration::from_millis(timeout_ms),
            max_restart_attempts: max_attempts,
            ..CallConfig::default()
        }
    }

    fn sample(sent: u64, lost: i64) -> TransportSample {
        TransportSample {
            packets_sent: sent,
            packets_lost: lost,
            round_trip_time: None,
        }
    }

    #[tokio::test]
    async fn watchdog_restarts_once_per_expiry_then_gives_up() {
        let mut sup = ReconnectionSupervisor::new(&config(2_000, 10_000, 2));
        let start = Instant::now();
        sup.negotiation_started(start);

        let first_deadline = sup.deadline().expect("armed");
        assert_eq!(first_deadline, start + Duration::from_secs(10));

        assert_eq!(sup.on_deadline(first_deadline), SupervisorAction::Restart);
        assert_eq!(sup.attempts(), 1);

        let second_deadline = sup.deadline().expect("re-armed");
        assert_eq!(sup.on_deadline(second_deadline), SupervisorAction::Restart);
        assert_eq!(sup.attempts(), 2);

        let third_deadline = sup.deadline().expect("re-armed again");
        assert_eq!(sup.on_deadline(third_deadline), SupervisorAction::GiveUp);
        assert!(sup.deadline().is_none());
    }

    #[tokio::test]
    async fn disconnect_arms_grace_and_reconnect_clears_it() {
        let mut sup = ReconnectionSupervisor::new(&config(2_000, 10_000, 2));
        let now = Instant::now();

        assert_eq!(
            sup.on_connection_state(ConnectionState::Disconnected, now),
            SupervisorAction::None
        );
        assert_eq!(sup.deadline(), Some(now + Duration::from_secs(2)));

        assert_eq!(
            sup.on_connection_state(ConnectionState::Connected, now + Duration::from_millis(500)),
            SupervisorAction::None
        );
        assert!(sup.deadline().is_none());
    }

    #[tokio::test]
    async fn grace_expiry_escalates_to_restart() {
        let mut sup = ReconnectionSupervisor::new(&config(2_000, 10_000, 2));
        let now = Instant::now();
        sup.on_connection_state(ConnectionState::Disconnected, now);

        let deadline = sup.deadline().expect("grace armed");
        assert_eq!(sup.on_deadline(deadline), SupervisorAction::Restart);
        assert_eq!(sup.attempts(), 1);
        // the restarted round is covered by a watchdog, not the grace
        assert_eq!(sup.deadline(), Some(deadline + Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn failed_state_escalates_immediately() {
        let mut sup = ReconnectionSupervisor::new(&config(2_000, 10_000, 2));
        assert_eq!(
            sup.on_connection_state(ConnectionState::Failed, Instant::now()),
            SupervisorAction::Restart
        );
        assert_eq!(sup.attempts(), 1);
    }

    #[tokio::test]
    async fn recovery_resets_the_attempt_budget() {
        let mut sup = ReconnectionSupervisor::new(&config(2_000, 10_000, 2));
        let now = Instant::now();

        sup.on_connection_state(ConnectionState::Failed, now);
        sup.on_connection_state(ConnectionState::Failed, now);
        assert_eq!(sup.attempts(), 2);

        sup.on_connection_state(ConnectionState::Connected, now);
        assert_eq!(sup.attempts(), 0);

        // a later outage gets the full budget again
        assert_eq!(
            sup.on_connection_state(ConnectionState::Failed, now),
            SupervisorAction::Restart
        );
    }

    #[tokio::test]
    async fn spurious_wake_keeps_the_deadline() {
        let mut sup = ReconnectionSupervisor::new(&config(2_000, 10_000, 2));
        let now = Instant::now();
        sup.negotiation_started(now);

        assert_eq!(sup.on_deadline(now), SupervisorAction::None);
        assert_eq!(sup.deadline(), Some(now + Duration::from_secs(10)));
    }

    #[test]
    fn quality_meter_classifies_and_emits_only_changes() {
        let mut meter = QualityMeter::new();

        assert_eq!(meter.record(sample(1_000, 0)), Some(LinkQuality::Good));
        assert_eq!(meter.record(sample(2_000, 0)), None);

        // 30% loss over the interval pushes the EMA past the poor line
        assert_eq!(meter.record(sample(3_000, 300)), Some(LinkQuality::Poor));

        // clean intervals decay the EMA back down through medium
        assert_eq!(meter.record(sample(4_000, 300)), Some(LinkQuality::Medium));
        let mut seen_good = false;
        for i in 5..12 {
            if meter.record(sample(i * 1_000, 300)) == Some(LinkQuality::Good) {
                seen_good = true;
                break;
            }
        }
        assert!(seen_good);
        assert_eq!(meter.current(), Some(LinkQuality::Good));
    }

    #[test]
    fn quality_meter_skips_idle_intervals() {
        let mut meter = QualityMeter::new();
        meter.record(sample(1_000, 0));

        // no packets sent since the last sample: no reclassification
        assert_eq!(meter.record(sample(1_000, 0)), None);
        assert_eq!(meter.current(), Some(LinkQuality::Good));
    }

    #[test]
    fn quality_meter_tolerates_counter_resets() {
        let mut meter = QualityMeter::new();
        assert_eq!(meter.record(sample(5_000, 100)), Some(LinkQuality::Good));

        // transport restarted and counters went backwards
        assert_eq!(meter.record(sample(100, 0)), None);
        assert_eq!(meter.record(sample(1_100, 0)), None);
        assert_eq!(meter.current(), Some(LinkQuality::Good));
    }
}
