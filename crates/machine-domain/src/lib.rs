mod engine;
mod errors;
mod lock;
mod progress;
mod segment;

pub use engine::{Build, BuildJobRunnerType, BuildJobState, BuildStage, Engine, EngineType};
pub use errors::DomainError;
pub use lock::{Lease, LockDocument, QueuedWriter};
pub use progress::{BuildPhase, BuildPhaseStage, ProgressStatus};
pub use segment::TrainSegmentPair;
