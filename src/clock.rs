use chrono::{Local, NaiveDate, NaiveDateTime};

/// Source of local wall-clock time. Date codes, ledger partitions and
/// `Time` columns all follow it.
pub trait Clock {
    fn now(&self) -> NaiveDateTime;

    fn today(&self) -> NaiveDate {
        self.now().date()
    }
}

/// The workstation's local time.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}
