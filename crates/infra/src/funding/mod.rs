//! Funding schedule processing job.

pub mod arguments;
pub mod handler;
pub mod processor;

pub use arguments::ProcessFundingScheduleArguments;
pub use handler::ProcessFundingScheduleHandler;
pub use processor::{ProcessFundingScheduleJob, ProcessingReport};

/// Queue carrying [`ProcessFundingScheduleArguments`].
pub const PROCESS_FUNDING_SCHEDULES_QUEUE: &str = "ProcessFundingSchedules";

/// Top of every hour.
pub const DEFAULT_FUNDING_SCHEDULE: &str = "0 0 * * * *";
