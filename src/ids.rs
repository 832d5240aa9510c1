//! Identifier generation
//!
//! Ids are `<prefix>_<millis>_<seq>_<random>`: the zero-padded millisecond
//! timestamp and a process-wide sequence number make ids sort in creation
//! order within one process, the random suffix keeps ids from separate
//! processes apart. Cross-process uniqueness is probabilistic only.

use chrono::Utc;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn next_id(prefix: &str) -> String {
    let millis = Utc::now().timestamp_millis().max(0);
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed) % 1_000_000;
    let suffix: u32 = rand::rng().random();
    format!("{}_{:013}_{:06}_{:08x}", prefix, millis, seq, suffix)
}

pub fn message_id() -> String {
    next_id("msg")
}

pub fn session_id() -> String {
    next_id("session")
}

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
