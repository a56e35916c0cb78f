//! Ejecución de las etapas de un build: plantilla de ciclo de vida común
//! y las tres etapas (preproceso, entrenamiento local y postproceso).
mod executor;
mod lifecycle;
mod stages;

pub use executor::StageJobExecutor;
pub use lifecycle::{BuildJobLifecycle, BuildStageJob, JobCompletionStatus};
pub use stages::{CorpusPayload, PostprocessJob, PostprocessPayload, PreprocessJob, StageJob, TrainJob};

use crate::config::BuildJobOptions;
use crate::engine_state::EngineStateService;
use crate::platform::PlatformService;
use crate::service::BuildJobService;
use crate::shared_files::SharedFileService;
use data_access::{DataAccessContext, Repository};
use machine_domain::{Engine, TrainSegmentPair};
use machine_lock::LockFactory;
use std::sync::Arc;

/// Colaboradores que comparten todas las etapas.
pub struct BuildJobContext {
  pub engines: Arc<dyn Repository<Engine>>,
  pub train_segment_pairs: Arc<dyn Repository<TrainSegmentPair>>,
  pub data_access: Arc<dyn DataAccessContext>,
  pub build_jobs: Arc<BuildJobService>,
  pub platform: Arc<dyn PlatformService>,
  pub shared_files: Arc<dyn SharedFileService>,
  pub locks: Arc<LockFactory>,
  pub engine_states: Arc<EngineStateService>,
  pub options: BuildJobOptions,
}

/// Prefijo de los ficheros de trabajo de un build.
pub fn build_dir(build_id: &str) -> String {
  format!("builds/{build_id}/")
}
