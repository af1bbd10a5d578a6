//! Process-wide counters for the tracker loop.
//! Logged as a summary at shutdown and asserted on in tests.
use std::sync::atomic::{AtomicU64, Ordering};

static EVENTS_DECODED: AtomicU64 = AtomicU64::new(0);
static DECODE_ERRORS: AtomicU64 = AtomicU64::new(0);
static REPLIES_SENT: AtomicU64 = AtomicU64::new(0);
static REPLIES_SKIPPED: AtomicU64 = AtomicU64::new(0);
static SAVES_OK: AtomicU64 = AtomicU64::new(0);
static SAVES_FAILED: AtomicU64 = AtomicU64::new(0);

pub fn inc_events_decoded() {
    EVENTS_DECODED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_decode_errors() {
    DECODE_ERRORS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_replies_sent() {
    REPLIES_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_replies_skipped() {
    REPLIES_SKIPPED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_saves_ok() {
    SAVES_OK.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_saves_failed() {
    SAVES_FAILED.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub events_decoded: u64,
    pub decode_errors: u64,
    pub replies_sent: u64,
    pub replies_skipped: u64,
    pub saves_ok: u64,
    pub saves_failed: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        events_decoded: EVENTS_DECODED.load(Ordering::Relaxed),
        decode_errors: DECODE_ERRORS.load(Ordering::Relaxed),
        replies_sent: REPLIES_SENT.load(Ordering::Relaxed),
        replies_skipped: REPLIES_SKIPPED.load(Ordering::Relaxed),
        saves_ok: SAVES_OK.load(Ordering::Relaxed),
        saves_failed: SAVES_FAILED.load(Ordering::Relaxed),
    }
}
