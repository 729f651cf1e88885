use std::time::Duration;

/// Inbound notification throughput over a fixed window
#[derive(Debug)]
pub struct PacketRateMonitor {
    window: Duration,
    count: u64,
    rate: f64,
}

impl PacketRateMonitor {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            count: 0,
            rate: 0.0,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn record_packet(&mut self) {
        self.count += 1;
    }

    /// Last reported packets per second
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Close the current window
    ///
    /// Returns the new rate only when it differs from the last reported one.
    pub fn tick(&mut self) -> Option<f64> {
        let rate = self.count as f64 / self.window.as_secs_f64();
        self.count = 0;
        self.update(rate)
    }

    /// Drop the pending count and report zero
    pub fn reset(&mut self) -> Option<f64> {
        self.count = 0;
        self.update(0.0)
    }

    fn update(&mut self, rate: f64) -> Option<f64> {
        if rate == self.rate {
            return None;
        }
        self.rate = rate;
        Some(rate)
    }
}
