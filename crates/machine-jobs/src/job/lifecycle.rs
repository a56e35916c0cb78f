// Archivo: job/lifecycle.rs
// Propósito: plantilla común de las etapas: inicializar, marcar el build
// como activo, trabajar y limpiar, con el tratamiento estándar de
// cancelación, reinicio y fallo.
use super::BuildJobContext;
use crate::errors::{MachineError, Result};
use crate::runner::JobDefinition;
use async_trait::async_trait;
use data_access::with_transaction;
use log::{error, info};
use machine_domain::{BuildJobState, BuildStage, Engine};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCompletionStatus {
  Completed,
  Faulted,
  Canceled,
  Restarting,
}

/// Una etapa concreta de un build.
#[async_trait]
pub trait BuildStageJob: Send + Sync {
  async fn initialize(&self, _job: &JobDefinition, _cancel: &CancellationToken) -> Result<()> {
    Ok(())
  }

  async fn do_work(&self, job: &JobDefinition, cancel: &CancellationToken) -> Result<()>;

  /// Se ejecuta siempre al final, con el resultado de la etapa.
  async fn cleanup(&self, _job: &JobDefinition, _status: JobCompletionStatus) {}
}

pub struct BuildJobLifecycle {
  ctx: Arc<BuildJobContext>,
}

impl BuildJobLifecycle {
  pub fn new(ctx: Arc<BuildJobContext>) -> Self {
    Self { ctx }
  }

  /// Ejecuta la etapa. Un reinicio o un fallo se propagan para que el
  /// runner aplique su política; la cancelación de negocio termina en
  /// `Ok`.
  pub async fn run(&self, stage: &dyn BuildStageJob, job: &JobDefinition, cancel: &CancellationToken) -> Result<()> {
    let (status, result) = match self.execute(stage, job, cancel).await {
      Ok(status) => (status, Ok(())),
      Err(e) if e.is_canceled() => self.canceled(job, e).await,
      Err(e) => self.faulted(job, e).await,
    };
    stage.cleanup(job, status).await;
    result
  }

  async fn execute(&self, stage: &dyn BuildStageJob, job: &JobDefinition, cancel: &CancellationToken) -> Result<JobCompletionStatus> {
    stage.initialize(job, cancel).await?;
    if !self.mark_started(job, cancel).await? {
      info!("build {} cancelado antes de la etapa {:?}", job.build_id, job.stage);
      return Ok(JobCompletionStatus::Canceled);
    }
    stage.do_work(job, cancel).await?;
    Ok(JobCompletionStatus::Completed)
  }

  /// Pending → Active bajo el lock de escritor del motor. El entrenamiento
  /// notifica además el arranque del build.
  async fn mark_started(&self, job: &JobDefinition, cancel: &CancellationToken) -> Result<bool> {
    let ctx = self.ctx.as_ref();
    let lock = ctx.locks.get(&job.engine_id);
    lock.with_writer_lock(None, None, cancel, |_| async move {
          with_transaction(ctx.data_access.as_ref(), || async move {
            if !ctx.build_jobs.build_job_started(&job.engine_id, &job.build_id).await? {
              return Ok(false);
            }
            if job.stage == BuildStage::Train {
              ctx.platform.build_started(&job.build_id).await?;
            }
            Ok(true)
          }).await
        })
        .await
  }

  /// La cancelación puede venir de una petición (el build está en
  /// `Canceling`) o del apagado del host (el build sigue vivo). El estado
  /// `Canceling` se comprueba primero.
  async fn canceled(&self, job: &JobDefinition, err: MachineError) -> (JobCompletionStatus, Result<()>) {
    match self.resolve_cancellation(job).await {
      Ok(JobCompletionStatus::Restarting) => (JobCompletionStatus::Restarting, Err(err)),
      Ok(status) => (status, Ok(())),
      Err(e) => {
        error!("no se pudo registrar la cancelación del build {}: {}", job.build_id, e);
        (JobCompletionStatus::Faulted, Err(e))
      }
    }
  }

  async fn resolve_cancellation(&self, job: &JobDefinition) -> Result<JobCompletionStatus> {
    let ctx = self.ctx.as_ref();
    let lock = ctx.locks.get(&job.engine_id);
    let cancel = CancellationToken::new();
    lock.with_writer_lock(None, None, &cancel, |_| async move {
          let engine = ctx.engines
                          .get(&|e: &Engine| {
                            e.engine_id == job.engine_id
                            && e.current_build.as_ref().is_some_and(|b| b.build_id == job.build_id)
                          })
                          .await?;
          match engine.map(|e| e.job_state()) {
            Some(BuildJobState::Canceling) => finish_canceled(ctx, job).await,
            Some(BuildJobState::Pending) => {
              // interrumpido antes de marcarse activo: el job se reentrega tal cual
              ctx.platform.build_restarting(&job.build_id).await?;
              info!("build {} interrumpido antes de empezar, se reiniciará", job.build_id);
              Ok(JobCompletionStatus::Restarting)
            }
            Some(_) => {
              let restarted = with_transaction(ctx.data_access.as_ref(), || async move {
                                if !ctx.build_jobs.build_job_restarting(&job.engine_id, &job.build_id).await? {
                                  return Ok(false);
                                }
                                ctx.platform.build_restarting(&job.build_id).await?;
                                Ok::<_, MachineError>(true)
                              }).await?;
              if !restarted {
                // la cancelación llegó después de leer el estado
                return finish_canceled(ctx, job).await;
              }
              info!("build {} interrumpido, se reiniciará", job.build_id);
              Ok(JobCompletionStatus::Restarting)
            }
            None => Ok(JobCompletionStatus::Canceled),
          }
        })
        .await
  }

  async fn faulted(&self, job: &JobDefinition, err: MachineError) -> (JobCompletionStatus, Result<()>) {
    let message = err.to_string();
    let ctx = self.ctx.as_ref();
    let lock = ctx.locks.get(&job.engine_id);
    let cancel = CancellationToken::new();
    let recorded = lock.with_writer_lock(None, None, &cancel, |_| async {
                         with_transaction(ctx.data_access.as_ref(), || async {
                           ctx.platform.build_faulted(&job.build_id, &message).await?;
                           ctx.build_jobs.build_job_finished(&job.engine_id, &job.build_id, false).await?;
                           Ok::<_, MachineError>(())
                         }).await
                       })
                       .await;
    if let Err(e) = recorded {
      error!("no se pudo registrar el fallo del build {}: {}", job.build_id, e);
    }
    error!("build {} fallido en {:?}: {}", job.build_id, job.stage, message);
    (JobCompletionStatus::Faulted, Err(err))
  }
}

async fn finish_canceled(ctx: &BuildJobContext, job: &JobDefinition) -> Result<JobCompletionStatus> {
  with_transaction(ctx.data_access.as_ref(), || async move {
    if ctx.build_jobs.build_job_finished(&job.engine_id, &job.build_id, false).await? {
      ctx.platform.build_canceled(&job.build_id).await?;
    }
    Ok::<_, MachineError>(())
  }).await?;
  info!("build {} cancelado", job.build_id);
  Ok(JobCompletionStatus::Canceled)
}
