//! Deterministic trace synthesis.
//!
//! Inputs that arrive without a trace context get one derived purely from
//! the configured trace id and the event's canonical tuple, so every run
//! over the same inputs produces identical span identifiers and sampling
//! decisions.

use vigil_types::TraceContext;

/// Synthesize the span id for an event: the first 8 bytes of
/// `blake3(trace_id | slot | signature | event_name | sequence)`, hex.
pub fn synthesize_span_id(
    trace_id: &str,
    slot: u64,
    signature: &str,
    event_name: &str,
    sequence: u64,
) -> String {
    let input = format!("{trace_id}|{slot}|{signature}|{event_name}|{sequence}");
    let digest = vigil_canonical::digest_bytes(input.as_bytes());
    hex::encode(&digest[..8])
}

/// Deterministic sampling: map the span id onto `[0, 1)` and compare with
/// the configured rate. The same span id always samples the same way.
pub fn deterministic_sample(sample_rate: f64, span_id: &str) -> bool {
    if sample_rate >= 1.0 {
        return true;
    }
    if sample_rate <= 0.0 {
        return false;
    }
    let digest = vigil_canonical::digest_bytes(span_id.as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    let ratio = u64::from_be_bytes(buf) as f64 / u64::MAX as f64;
    ratio < sample_rate
}

/// Build the full synthesized context for an event.
pub fn synthesize_context(
    trace_id: &str,
    sample_rate: f64,
    slot: u64,
    signature: &str,
    event_name: &str,
    sequence: u64,
) -> TraceContext {
    let span_id = synthesize_span_id(trace_id, slot, signature, event_name, sequence);
    let sampled = deterministic_sample(sample_rate, &span_id);
    TraceContext {
        trace_id: trace_id.to_string(),
        span_id,
        parent_span_id: None,
        sampled,
    }
}
