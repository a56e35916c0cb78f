use super::lifecycle::BuildJobLifecycle;
use super::stages::StageJob;
use super::BuildJobContext;
use crate::errors::Result;
use crate::runner::{BuildJobExecutor, JobDefinition};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Ejecutor que el runner local invoca para cada job.
pub struct StageJobExecutor {
  ctx: Arc<BuildJobContext>,
  lifecycle: BuildJobLifecycle,
}

impl StageJobExecutor {
  pub fn new(ctx: Arc<BuildJobContext>) -> Self {
    Self { lifecycle: BuildJobLifecycle::new(ctx.clone()),
           ctx }
  }
}

#[async_trait]
impl BuildJobExecutor for StageJobExecutor {
  async fn execute(&self, job: &JobDefinition, cancel: CancellationToken) -> Result<()> {
    let stage = StageJob::new(job.stage, self.ctx.clone());
    self.lifecycle.run(&stage, job, &cancel).await
  }
}
