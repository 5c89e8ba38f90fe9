use std::sync::Arc;

use chrono::{TimeZone, Utc};
use printassist_core::clock::test_support::FixedClock;
use printassist_core::clock::Clock;

/// A clock pinned to a specific UTC instant, for deterministic store and
/// coordinator tests.
pub fn test_clock(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> Arc<dyn Clock> {
    Arc::new(FixedClock::new(Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()))
}
