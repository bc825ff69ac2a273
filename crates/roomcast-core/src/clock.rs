//! Timestamps and message identifiers.

use roomcast_protocol::MessageId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Low bits of the first ID left free for the counter.
const ID_SEED_SHIFT: u32 = 20;

/// Next message ID. Seeded once from the wall clock, then only incremented.
static NEXT_ID: OnceLock<AtomicU64> = OnceLock::new();

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate a message ID, unique within the process.
///
/// IDs increase strictly in call order and never depend on later clock
/// readings, so a clock step cannot produce a repeat.
#[must_use]
pub fn generate_message_id() -> MessageId {
    NEXT_ID
        .get_or_init(|| AtomicU64::new(now_millis() << ID_SEED_SHIFT))
        .fetch_add(1, Ordering::Relaxed)
}

/// Wall clock that never goes backwards.
///
/// Readings are non-decreasing in the order `now` is called, even when the
/// system clock is stepped back.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicU64,
}

impl MonotonicClock {
    /// Create a new clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current time in milliseconds, never earlier than a previous reading.
    pub fn now(&self) -> u64 {
        self.observe(now_millis())
    }

    fn observe(&self, wall: u64) -> u64 {
        let previous = self.last.fetch_max(wall, Ordering::SeqCst);
        previous.max(wall)
    }
}
