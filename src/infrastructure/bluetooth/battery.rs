use crate::domain::error::ConnectorError;
use crate::infrastructure::bluetooth::protocol::RingCommand;
use crate::infrastructure::timer::{TimerKind, Timers};
use std::time::{Duration, Instant};
use tracing::debug;

/// Periodic battery-level requests while the ring is streaming
#[derive(Debug)]
pub struct BatteryPoller {
    interval: Duration,
    running: bool,
}

impl BatteryPoller {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            running: false,
        }
    }

    /// Arm the repeating poll; a poller that is already running is left alone
    pub fn start(&mut self, timers: &mut Timers, now: Instant) -> bool {
        if self.running {
            return false;
        }
        debug!("Battery polling every {:?}", self.interval);
        timers.schedule_repeating(TimerKind::BatteryPoll, now, self.interval);
        self.running = true;
        true
    }

    pub fn stop(&mut self, timers: &mut Timers) {
        timers.cancel(TimerKind::BatteryPoll);
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Command to send on a poll tick, if the link can carry it
    pub fn request(
        notifications_enabled: bool,
        rx_resolved: bool,
    ) -> Result<RingCommand, ConnectorError> {
        if notifications_enabled && rx_resolved {
            Ok(RingCommand::BatteryRequest)
        } else {
            Err(ConnectorError::WriteNotReady(RingCommand::BatteryRequest.label()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_is_idempotent() {
        let now = Instant::now();
        let mut timers = Timers::new();
        let mut poller = BatteryPoller::new(Duration::from_secs(30));

        assert!(poller.start(&mut timers, now));
        assert!(!poller.start(&mut timers, now + Duration::from_secs(10)));
        assert_eq!(
            timers.next_deadline(),
            Some(now + Duration::from_secs(30))
        );

        poller.stop(&mut timers);
        assert!(!poller.is_running());
        assert!(!timers.is_scheduled(TimerKind::BatteryPoll));
    }

    #[test]
    fn test_request_requires_ready_link() {
        assert_eq!(
            BatteryPoller::request(true, true),
            Ok(RingCommand::BatteryRequest)
        );
        assert!(matches!(
            BatteryPoller::request(false, true),
            Err(ConnectorError::WriteNotReady(_))
        ));
        assert!(matches!(
            BatteryPoller::request(true, false),
            Err(ConnectorError::WriteNotReady(_))
        ));
    }
}
