//! Token usage accounting.

pub mod ledger;
pub mod ticker;

pub use ledger::{UsageLedger, WeeklyUsageRecord};
pub use ticker::RolloverTicker;
