//! Task identifiers.
//!
//! A `TaskId` packs three fields into one sortable `u64`:
//!
//! | bits  | field                                   |
//! |-------|-----------------------------------------|
//! | 61-63 | `7 - priority`                          |
//! | 32-60 | low 29 bits of wall-clock milliseconds  |
//! | 0-31  | randomized counter                      |
//!
//! 優先度を反転して格納するので、数値の小さい ID ほど高優先度になり、
//! ソート済みスキャンが「高優先度・古い順」にタスクを返します。

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::priority::Priority;
use crate::ports::Clock;

const TIME_MASK: u64 = 0x1FFF_FFFF;
const PRIORITY_SHIFT: u32 = 61;
const TIME_SHIFT: u32 = 32;
const WRAP_PAUSE: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn priority(&self) -> Priority {
        let inverted = (self.0 >> PRIORITY_SHIFT) as u8;
        Priority::new(Priority::MAX_VALUE - inverted).unwrap_or_default()
    }

    /// Low 29 bits of the submission time in milliseconds.
    pub const fn time_bits(&self) -> u64 {
        (self.0 >> TIME_SHIFT) & TIME_MASK
    }

    pub const fn counter(&self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

/// Generates `TaskId`s from a shared counter.
///
/// プロセス全体で 1 つ構築し、`Arc` で共有します。カウンタには毎回 0 以外の
/// ランダムな 16 bit オフセットを加算し、32 bit を一周したときは 1ms 待って
/// 時刻フィールドが進むのを保証します。
pub struct TaskIdGenerator {
    clock: Arc<dyn Clock>,
    counter: Mutex<u32>,
}

impl TaskIdGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_counter(clock, rand::random())
    }

    /// Start from a known counter value.
    pub fn with_counter(clock: Arc<dyn Clock>, start: u32) -> Self {
        Self {
            clock,
            counter: Mutex::new(start),
        }
    }

    pub fn next_id(&self, priority: Priority) -> TaskId {
        let offset: u32 = rand::thread_rng().gen_range(1..=u32::from(u16::MAX));

        let mut counter = self.counter.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = *counter;
        let next = previous.wrapping_add(offset);
        if next < previous {
            // Wrapped: make sure the millisecond field moves past the last id.
            // The lock stays held across the pause so no other caller issues a
            // wrapped counter in the old millisecond.
            std::thread::sleep(WRAP_PAUSE);
        }
        *counter = next;

        let millis = self.clock.timestamp().as_millis() as u64;
        let inverted = u64::from(Priority::MAX_VALUE - priority.value());
        TaskId(
            (inverted << PRIORITY_SHIFT) | ((millis & TIME_MASK) << TIME_SHIFT) | u64::from(next),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{ManualClock, SystemClock};
    use chrono::{TimeZone, Utc};

    fn fixed_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ))
    }

    #[test]
    fn fields_land_in_their_bit_ranges() {
        let clock = fixed_clock();
        let ids = TaskIdGenerator::with_counter(clock.clone(), 100);

        let id = ids.next_id(Priority::new(5).unwrap());

        assert_eq!(id.as_u64() >> 61, 2);
        assert_eq!(id.priority(), Priority::new(5).unwrap());
        assert_eq!(id.time_bits(), clock.timestamp().as_millis() as u64 & TIME_MASK);
        assert!(id.counter() > 100);
        assert!(id.counter() <= 100 + u32::from(u16::MAX));
    }

    #[test]
    fn higher_priority_sorts_first() {
        let ids = TaskIdGenerator::new(fixed_clock());
        let low = ids.next_id(Priority::LOW);
        let high = ids.next_id(Priority::new(7).unwrap());
        assert!(high < low);
    }

    #[test]
    fn counter_never_repeats_within_a_millisecond() {
        let ids = TaskIdGenerator::with_counter(fixed_clock(), 0);
        let a = ids.next_id(Priority::MEDIUM);
        let b = ids.next_id(Priority::MEDIUM);
        assert!(b > a);
    }

    #[test]
    fn ids_stay_monotonic_across_counter_wrap() {
        // The first call cannot wrap (offset <= u16::MAX), later ones will.
        let ids = TaskIdGenerator::with_counter(Arc::new(SystemClock), u32::MAX - 70_000);

        let generated: Vec<TaskId> = (0..64).map(|_| ids.next_id(Priority::MEDIUM)).collect();

        assert!(
            generated.windows(2).any(|w| w[1].counter() < w[0].counter()),
            "expected at least one counter wrap"
        );
        for pair in generated.windows(2) {
            assert!(pair[0] <= pair[1], "{} > {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn concurrent_callers_never_share_an_id_across_a_wrap() {
        let ids = TaskIdGenerator::with_counter(Arc::new(SystemClock), u32::MAX - 70_000);

        let mut all: Vec<TaskId> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| (0..32).map(|_| ids.next_id(Priority::MEDIUM)).collect::<Vec<_>>()))
                .collect();
            workers
                .into_iter()
                .flat_map(|w| w.join().unwrap())
                .collect()
        });

        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);
    }
}
