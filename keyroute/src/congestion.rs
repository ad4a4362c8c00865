//! AIMD congestion window, one per connection.
//!
//! Growth is byte-granular: slow start adds `acked / GAMMA` per ack, then
//! congestion avoidance adds `acked² × ALPHA / window`. Loss multiplies the
//! window by `BETA`. The window always stays within `[MIN_CWIND, MAX_CWIND]`.

use crate::types::{ALPHA, BETA, GAMMA, MAX_CWIND, MIN_CWIND};

#[derive(Debug, Clone)]
pub struct CongestionWindow {
    window: f64,
    in_flight: usize,
    slow_start: bool,
}

impl Default for CongestionWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl CongestionWindow {
    pub fn new() -> Self {
        Self {
            window: MIN_CWIND,
            in_flight: 0,
            slow_start: true,
        }
    }

    pub fn size(&self) -> f64 {
        self.window
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn in_slow_start(&self) -> bool {
        self.slow_start
    }

    /// Bytes that may still be put in flight. Negative after a decrease.
    pub fn available(&self) -> i64 {
        self.window as i64 - self.in_flight as i64
    }

    pub fn bytes_sent(&mut self, bytes: usize) {
        self.in_flight += bytes;
    }

    pub fn bytes_acked(&mut self, bytes: usize) {
        self.in_flight = self.in_flight.saturating_sub(bytes);
        let acked = bytes as f64;
        if self.slow_start {
            self.window += acked / GAMMA;
        } else {
            self.window += acked * acked * ALPHA / self.window;
        }
        self.window = self.window.min(MAX_CWIND);
    }

    /// Loss inferred from a later ack.
    pub fn fast_retransmission(&mut self) {
        self.window = (self.window * BETA).max(MIN_CWIND);
        self.slow_start = false;
    }

    /// Loss detected by the retransmission timer.
    ///
    /// The first loss only ends slow start. After that a timeout means the
    /// path has changed, so the window starts over.
    pub fn timeout(&mut self) {
        if self.slow_start {
            self.fast_retransmission();
        } else {
            self.reset();
        }
    }

    /// Back to the minimum window and slow start, e.g. after the link was idle.
    pub fn reset(&mut self) {
        self.window = MIN_CWIND;
        self.slow_start = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_bounded(cw: &CongestionWindow) {
        assert!(cw.size() >= MIN_CWIND, "window {} below minimum", cw.size());
        assert!(cw.size() <= MAX_CWIND, "window {} above maximum", cw.size());
    }

    #[test]
    fn test_starts_at_minimum_in_slow_start() {
        let cw = CongestionWindow::new();
        assert_eq!(cw.size(), MIN_CWIND);
        assert!(cw.in_slow_start());
        assert_eq!(cw.available(), MIN_CWIND as i64);
    }

    #[test]
    fn test_slow_start_growth() {
        let mut cw = CongestionWindow::new();
        cw.bytes_sent(1500);
        assert_eq!(cw.available(), 1500);
        cw.bytes_acked(1500);
        assert_eq!(cw.in_flight(), 0);
        assert_eq!(cw.size(), MIN_CWIND + 500.0);
    }

    #[test]
    fn test_congestion_avoidance_growth() {
        let mut cw = CongestionWindow::new();
        cw.fast_retransmission();
        assert!(!cw.in_slow_start());
        let before = cw.size();
        cw.bytes_sent(1000);
        cw.bytes_acked(1000);
        let expected = before + 1000.0 * 1000.0 * ALPHA / before;
        assert!((cw.size() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_fast_retransmission_decreases_and_clamps() {
        let mut cw = CongestionWindow::new();
        for _ in 0..100 {
            cw.bytes_sent(1400);
            cw.bytes_acked(1400);
        }
        let grown = cw.size();
        cw.fast_retransmission();
        assert!((cw.size() - grown * BETA).abs() < 1e-9);

        for _ in 0..100 {
            cw.fast_retransmission();
        }
        assert_eq!(cw.size(), MIN_CWIND);
    }

    #[test]
    fn test_timeout_in_slow_start_only_ends_it() {
        let mut cw = CongestionWindow::new();
        for _ in 0..10 {
            cw.bytes_sent(3000);
            cw.bytes_acked(3000);
        }
        let grown = cw.size();
        cw.timeout();
        assert!(!cw.in_slow_start());
        assert!((cw.size() - grown * BETA).abs() < 1e-9);

        // Second timeout, after slow start: full reset.
        cw.timeout();
        assert!(cw.in_slow_start());
        assert_eq!(cw.size(), MIN_CWIND);
    }

    #[test]
    fn test_window_never_exceeds_max() {
        let mut cw = CongestionWindow::new();
        for _ in 0..10_000 {
            cw.bytes_sent(1400);
            cw.bytes_acked(1400);
            assert_bounded(&cw);
        }
        assert_eq!(cw.size(), MAX_CWIND);
    }

    #[test]
    fn test_bounds_hold_under_mixed_events() {
        let mut cw = CongestionWindow::new();
        for i in 0..5_000u32 {
            match i % 7 {
                0 => cw.fast_retransmission(),
                3 => cw.timeout(),
                5 if i % 35 == 5 => cw.reset(),
                _ => {
                    cw.bytes_sent(1200);
                    cw.bytes_acked(1200);
                }
            }
            assert_bounded(&cw);
        }
    }
}
