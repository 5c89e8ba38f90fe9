use chrono::{DateTime, Utc};

/// Monotonic source of "now" in UTC, injected so scheduler/store/coordinator
/// tests can pin time instead of racing the wall clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;
    use std::sync::RwLock;

    /// A clock that only advances when told to.
    pub struct FixedClock(RwLock<DateTime<Utc>>);

    impl FixedClock {
        pub fn new(at: DateTime<Utc>) -> Self {
            Self(RwLock::new(at))
        }

        pub fn set(&self, at: DateTime<Utc>) {
            *self.0.write().unwrap() = at;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.read().unwrap()
        }
    }
}
