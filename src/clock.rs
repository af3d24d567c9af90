use chrono::{DateTime, Utc};

/// Source of the current time. Queue and aliveness code never read the system clock
/// directly so that staleness can be driven by tests.
pub trait DateProvider: Send + Sync {
    fn current_date(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDateProvider;

impl DateProvider for SystemDateProvider {
    fn current_date(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
