//! Client configuration.

use std::time::Duration;

/// Tuning of reconciliation, interpolation, streaming and the transport.
///
/// The thresholds and rates are empirical. Only the three-tier strategy they
/// parameterise matters for correctness.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Prediction errors below this many metres are left alone.
    pub small_error_threshold: f32,
    /// Prediction errors above this many metres snap to the server state.
    pub large_error_threshold: f32,
    /// Fraction of the remaining gap the rendered position closes per snapshot.
    pub render_correction_rate: f32,
    /// Fraction of the gap the prediction baseline closes per snapshot.
    pub baseline_correction_rate: f32,
    /// Used until the server's world config says otherwise.
    pub interpolation_delay_ms: f64,
    pub max_unacked_inputs: usize,
    pub event_queue: usize,
    pub reconnect_delay: Duration,
    pub ping_interval: Duration,
    /// Chebyshev radius of chunks kept for rendering. Kept below the
    /// server's physics radius so every drawn chunk is already simulated.
    pub render_chunk_radius: i32,
    pub max_chunk_requests_per_frame: usize,
    /// A chunk request unanswered for this long is sent again.
    pub chunk_request_retry: Duration,
    /// Artificial round trip added by the transport, split evenly both ways.
    pub fake_latency_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            small_error_threshold: 0.1,
            large_error_threshold: 3.0,
            render_correction_rate: 0.3,
            baseline_correction_rate: 0.1,
            interpolation_delay_ms: 100.0,
            max_unacked_inputs: 120,
            event_queue: 256,
            reconnect_delay: Duration::from_secs(2),
            ping_interval: Duration::from_secs(1),
            render_chunk_radius: 1,
            max_chunk_requests_per_frame: 2,
            chunk_request_retry: Duration::from_secs(2),
            fake_latency_ms: 0,
        }
    }
}
