use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the unix epoch. Expiry fields in signed
/// records (router contacts, introsets) are compared against this.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
