use chrono::{DateTime, Utc};

/// Defines the wall clock the compactor uses for wait-period checks, block
/// age observations, and garbage-collection timing. Injected at construction
/// so tests can pin time.
pub trait SystemClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Default)]
pub struct DefaultSystemClock;

impl DefaultSystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl SystemClock for DefaultSystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::Arc;

    use chrono::{DateTime, TimeDelta, Utc};
    use parking_lot::Mutex;

    use super::SystemClock;

    /// A clock pinned to a settable instant.
    pub(crate) struct TestClock {
        now: Arc<Mutex<DateTime<Utc>>>,
    }

    impl TestClock {
        pub(crate) fn new(now: DateTime<Utc>) -> Self {
            Self {
                now: Arc::new(Mutex::new(now)),
            }
        }

        pub(crate) fn advance(&self, delta: TimeDelta) {
            let mut guard = self.now.lock();
            *guard += delta;
        }
    }

    impl SystemClock for TestClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock()
        }
    }
}
