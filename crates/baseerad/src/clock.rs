use chrono::{Local, NaiveDateTime};
use std::time::Instant;

/// Time source for the pipeline.
///
/// Attendance is stamped with local wall time, while cooldown and throttle
/// windows are measured on the monotonic clock so DST changes and NTP steps
/// cannot stretch or shrink them.
pub trait Clock: Send {
    fn now(&self) -> NaiveDateTime;
    fn monotonic(&self) -> Instant;
}

/// Local time of the kiosk.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// True when at least `secs` have passed since `last`, or nothing happened yet.
pub fn interval_elapsed(last: Option<Instant>, now: Instant, secs: f64) -> bool {
    match last {
        None => true,
        Some(last) => now.saturating_duration_since(last).as_secs_f64() >= secs,
    }
}

#[cfg(test)]
pub(crate) mod manual {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct Readings {
        wall: NaiveDateTime,
        monotonic: Instant,
    }

    /// Test clock shared between the test body and the code under test.
    #[derive(Clone)]
    pub(crate) struct ManualClock(Arc<Mutex<Readings>>);

    impl ManualClock {
        pub(crate) fn at(start: NaiveDateTime) -> Self {
            Self(Arc::new(Mutex::new(Readings {
                wall: start,
                monotonic: Instant::now(),
            })))
        }

        /// Let real time pass until the wall clock reads `to`.
        pub(crate) fn advance_to(&self, to: NaiveDateTime) {
            let mut readings = self.0.lock().unwrap();
            let delta = (to - readings.wall).to_std().unwrap();
            readings.wall = to;
            readings.monotonic += delta;
        }

        pub(crate) fn advance_secs(&self, secs: u64) {
            let mut readings = self.0.lock().unwrap();
            readings.wall += chrono::Duration::seconds(secs as i64);
            readings.monotonic += Duration::from_secs(secs);
        }

        /// Move only the wall clock, as a DST change or NTP step does.
        pub(crate) fn step_wall_clock(&self, by: chrono::Duration) {
            self.0.lock().unwrap().wall += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> NaiveDateTime {
            self.0.lock().unwrap().wall
        }

        fn monotonic(&self) -> Instant {
            self.0.lock().unwrap().monotonic
        }
    }
}
