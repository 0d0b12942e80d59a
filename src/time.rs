use chrono::{DateTime, Utc};

/// Returns the current Unix time in whole seconds.
///
/// Telemetry timestamps on the wire use this coarse resolution, so both peers
/// must produce them the same way.
///
/// ```
/// use queue_latency::time::now_epoch_secs;
/// let now = now_epoch_secs();
/// assert!(now > 1_600_000_000);
/// ```
pub fn now_epoch_secs() -> i64 {
    epoch_secs(Utc::now())
}

fn epoch_secs(date: DateTime<Utc>) -> i64 {
    date.timestamp()
}

/// Processing delay between `received_at` and `sent_at`, saturated to the
/// 32-bit wire field.
pub fn processing_time(received_at: i64, sent_at: i64) -> i32 {
    let delta = sent_at.saturating_sub(received_at);
    delta.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}
