//! One-shot clock offset estimation against the rendezvous clock
//!
//! Assumes symmetric network delay: the server read its clock halfway
//! through our round trip.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::SessionError;
use crate::rendezvous::Rendezvous;

/// Local wall clock in unix seconds
pub fn wall_clock() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// `offset = server_time + rtt / 2 - t1`
pub fn estimate_offset(server_time: f64, t0: f64, t1: f64) -> f64 {
    let rtt = t1 - t0;
    server_time + rtt / 2.0 - t1
}

/// Offset added to local wall clock reads, fixed for the session
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClockOffset(f64);

impl ClockOffset {
    pub fn new(offset: f64) -> Self {
        Self(offset)
    }

    pub fn seconds(&self) -> f64 {
        self.0
    }

    /// Query the rendezvous time source once. Failure is fatal to startup.
    pub async fn synchronize<R: Rendezvous + ?Sized>(
        rendezvous: &R,
    ) -> Result<Self, SessionError> {
        let t0 = wall_clock();
        let server_time = rendezvous
            .server_time()
            .await
            .map_err(|e| SessionError::ClockSync(e.to_string()))?;
        let t1 = wall_clock();

        let offset = Self(estimate_offset(server_time, t0, t1));
        tracing::info!(
            "Clock offset {:+.2} ms (rtt {:.2} ms)",
            offset.0 * 1000.0,
            (t1 - t0) * 1000.0
        );
        Ok(offset)
    }

    /// Offset-corrected current time
    pub fn now(&self) -> f64 {
        self.corrected(wall_clock())
    }

    pub fn corrected(&self, local: f64) -> f64 {
        local + self.0
    }

    /// One-way latency of a frame stamped at `timestamp`, observed at local time `local_now`
    pub fn latency(&self, timestamp: f64, local_now: f64) -> f64 {
        self.corrected(local_now) - timestamp
    }
}

/// Last observed one-way latency, readable from any thread
#[derive(Debug, Default)]
pub struct LatencyGauge {
    bits: AtomicU64,
}

impl LatencyGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, seconds: f64) {
        self.bits.store(seconds.to_bits(), Ordering::Relaxed);
    }

    pub fn seconds(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn millis(&self) -> f64 {
        self.seconds() * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::memory::MemoryRendezvous;

    #[test]
    fn test_offset_formula() {
        let server_time = 1_700_000_000.0;
        let offset = estimate_offset(server_time, 100.0, 100.2);
        let expected = server_time + 0.1 - 100.2;
        assert!((offset - expected).abs() < 1e-6);
    }

    #[test]
    fn test_latency_round_trip_is_zero() {
        let offset = ClockOffset::new(estimate_offset(5_000.0, 100.0, 100.2));
        let local_now = 250.0;

        // A frame stamped by a sender sharing our clock, arriving instantly
        let stamped = offset.corrected(local_now);
        assert!(offset.latency(stamped, local_now).abs() < 1e-9);

        // Arriving 30 ms later
        assert!((offset.latency(stamped, local_now + 0.030) - 0.030).abs() < 1e-9);
    }

    #[test]
    fn test_latency_gauge() {
        let gauge = LatencyGauge::new();
        assert_eq!(gauge.seconds(), 0.0);
        gauge.record(0.042);
        assert!((gauge.millis() - 42.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_synchronize_against_server() {
        let rendezvous = MemoryRendezvous::default();
        *rendezvous.time.lock() = Some(wall_clock() + 10.0);

        let offset = ClockOffset::synchronize(&rendezvous).await.unwrap();
        assert!((offset.seconds() - 10.0).abs() < 0.5);
    }

    #[tokio::test]
    async fn test_synchronize_failure_is_fatal() {
        let rendezvous = MemoryRendezvous::default();
        let result = ClockOffset::synchronize(&rendezvous).await;
        assert!(matches!(result, Err(SessionError::ClockSync(_))));
    }
}
