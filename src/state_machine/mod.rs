mod phase;
mod work_order;

pub use phase::{Phase, Step};
pub use work_order::{ExecutionCounters, JobPaths, JobStatus, ManifestRef, OutputPaths, WorkOrder};
