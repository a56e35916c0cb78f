// Archivo: job/stages.rs
// Propósito: las etapas concretas de un build como variantes de `StageJob`.
use super::lifecycle::{BuildStageJob, JobCompletionStatus};
use super::{build_dir, BuildJobContext};
use crate::errors::{MachineError, Result};
use crate::platform::BuildStatus;
use crate::runner::JobDefinition;
use crate::shared_files::{read_lines, write_lines};
use async_trait::async_trait;
use data_access::with_transaction;
use log::{info, warn};
use machine_domain::{BuildJobRunnerType, BuildJobState, BuildStage, Engine, ProgressStatus, TrainSegmentPair};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Corpus paralelo que recibe el preproceso.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorpusPayload {
  #[serde(default)]
  pub source: Vec<String>,
  #[serde(default)]
  pub target: Vec<String>,
}

/// Resultado del entrenamiento que recibe el postproceso.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostprocessPayload {
  #[serde(default)]
  pub train_corpus_size: i32,
  #[serde(default)]
  pub confidence: f64,
}

fn payload<T: DeserializeOwned + Default>(data: &Option<JsonValue>) -> Result<T> {
  match data {
    None | Some(JsonValue::Null) => Ok(T::default()),
    Some(value) => Ok(serde_json::from_value(value.clone())?),
  }
}

fn check_canceled(cancel: &CancellationToken) -> Result<()> {
  if cancel.is_cancelled() {
    return Err(MachineError::Canceled);
  }
  Ok(())
}

fn src_path(build_id: &str) -> String {
  format!("{}train.src.txt", build_dir(build_id))
}

fn trg_path(build_id: &str) -> String {
  format!("{}train.trg.txt", build_dir(build_id))
}

fn model_path(build_id: &str) -> String {
  format!("{}model.bin", build_dir(build_id))
}

async fn delete_build_files(ctx: &BuildJobContext, build_id: &str) {
  if let Err(e) = ctx.shared_files.delete(&build_dir(build_id)).await {
    warn!("no se pudieron borrar los datos del build {}: {}", build_id, e);
  }
}

/// Escribe el corpus en el almacén compartido y encadena el entrenamiento.
pub struct PreprocessJob {
  ctx: Arc<BuildJobContext>,
}

impl PreprocessJob {
  pub fn new(ctx: Arc<BuildJobContext>) -> Self {
    Self { ctx }
  }
}

#[async_trait]
impl BuildStageJob for PreprocessJob {
  /// Vacía los pares del build anterior y empieza a recoger los que se
  /// entrenen mientras dura este.
  async fn initialize(&self, job: &JobDefinition, cancel: &CancellationToken) -> Result<()> {
    let ctx = self.ctx.as_ref();
    let lock = ctx.locks.get(&job.engine_id);
    lock.with_writer_lock(None, None, cancel, |_| async move {
          ctx.train_segment_pairs
             .delete_all(&|p: &TrainSegmentPair| p.engine_id == job.engine_id)
             .await?;
          ctx.engines
             .update_all(&|e: &Engine| {
                           e.engine_id == job.engine_id
                           && e.build_matches(&job.build_id, &[BuildJobState::Pending, BuildJobState::Active])
                         },
                         &|e: &mut Engine| e.collect_train_segment_pairs = true)
             .await?;
          Ok::<_, MachineError>(())
        })
        .await
  }

  async fn do_work(&self, job: &JobDefinition, cancel: &CancellationToken) -> Result<()> {
    let ctx = self.ctx.as_ref();
    let Some(engine) = ctx.engines.get_by_id(&job.engine_id).await? else {
      info!("el motor {} ya no existe; build {} cancelado", job.engine_id, job.build_id);
      return Err(MachineError::Canceled);
    };

    let corpus: CorpusPayload = payload(&job.data)?;
    if corpus.source.len() != corpus.target.len() {
      return Err(MachineError::Validation(format!("corpus desalineado: {} fuentes, {} destinos",
                                                  corpus.source.len(),
                                                  corpus.target.len())));
    }
    write_lines(ctx.shared_files.as_ref(), &src_path(&job.build_id), &corpus.source).await?;
    write_lines(ctx.shared_files.as_ref(), &trg_path(&job.build_id), &corpus.target).await?;

    let execution_data = BTreeMap::from([("train_count".to_string(), corpus.source.len().to_string()),
                                         ("src_lang".to_string(), engine.source_language.clone()),
                                         ("trg_lang".to_string(), engine.target_language.clone())]);
    ctx.platform
       .update_build_execution_data(&job.engine_id, &job.build_id, execution_data)
       .await?;

    check_canceled(cancel)?;

    let started = ctx.build_jobs
                     .start_build_job(ctx.options.train_runner(engine.engine_type),
                                      engine.engine_type,
                                      &job.engine_id,
                                      &job.build_id,
                                      BuildStage::Train,
                                      None,
                                      job.options.clone())
                     .await?;
    if !started {
      return Err(MachineError::Canceled);
    }
    Ok(())
  }

  async fn cleanup(&self, job: &JobDefinition, status: JobCompletionStatus) {
    if status == JobCompletionStatus::Canceled {
      delete_build_files(&self.ctx, &job.build_id).await;
    }
  }
}

/// Entrenamiento en proceso con la fábrica de modelos del tipo de motor.
pub struct TrainJob {
  ctx: Arc<BuildJobContext>,
}

impl TrainJob {
  pub fn new(ctx: Arc<BuildJobContext>) -> Self {
    Self { ctx }
  }
}

#[async_trait]
impl BuildStageJob for TrainJob {
  async fn do_work(&self, job: &JobDefinition, cancel: &CancellationToken) -> Result<()> {
    let ctx = self.ctx.as_ref();
    let source = read_lines(ctx.shared_files.as_ref(), &src_path(&job.build_id)).await?;
    let target = read_lines(ctx.shared_files.as_ref(), &trg_path(&job.build_id)).await?;
    let factory = ctx.engine_states.factory(job.engine_type)?;

    check_canceled(cancel)?;

    // Una vez dentro, el entrenamiento no se interrumpe.
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<ProgressStatus>();
    let training = tokio::task::spawn_blocking(move || {
      factory.train(&source, &target, &|p| {
               let _ = progress_tx.send(p);
             })
    });
    while let Some(progress) = progress_rx.recv().await {
      if let Err(e) = ctx.platform.update_build_status(&job.build_id, BuildStatus::new(progress)).await {
        warn!("no se pudo informar el progreso del build {}: {}", job.build_id, e);
      }
    }
    let trained = training.await
                          .map_err(|e| MachineError::Model(format!("entrenamiento abortado: {e}")))??;

    ctx.shared_files.write(&model_path(&job.build_id), trained.artifact).await?;

    check_canceled(cancel)?;

    let data = serde_json::to_value(PostprocessPayload { train_corpus_size: trained.train_corpus_size,
                                                         confidence: trained.confidence })?;
    let started = ctx.build_jobs
                     .start_build_job(BuildJobRunnerType::Local,
                                      job.engine_type,
                                      &job.engine_id,
                                      &job.build_id,
                                      BuildStage::Postprocess,
                                      Some(data),
                                      job.options.clone())
                     .await?;
    if !started {
      return Err(MachineError::Canceled);
    }
    Ok(())
  }

  async fn cleanup(&self, job: &JobDefinition, status: JobCompletionStatus) {
    if status == JobCompletionStatus::Canceled {
      delete_build_files(&self.ctx, &job.build_id).await;
    }
  }
}

/// Instala el modelo entrenado y cierra el build.
pub struct PostprocessJob {
  ctx: Arc<BuildJobContext>,
}

impl PostprocessJob {
  pub fn new(ctx: Arc<BuildJobContext>) -> Self {
    Self { ctx }
  }
}

#[async_trait]
impl BuildStageJob for PostprocessJob {
  async fn do_work(&self, job: &JobDefinition, cancel: &CancellationToken) -> Result<()> {
    let ctx = self.ctx.as_ref();
    let stats: PostprocessPayload = payload(&job.data)?;
    let (train_size, confidence) = (stats.train_corpus_size, stats.confidence);
    let artifact_path = model_path(&job.build_id);
    let artifact = if ctx.shared_files.exists(&artifact_path).await? {
      Some(ctx.shared_files.read(&artifact_path).await?)
    } else {
      None
    };

    let lock = ctx.locks.get(&job.engine_id);
    let save_timeout = ctx.engine_states.options().save_model_timeout;
    lock.with_writer_lock(Some(save_timeout), None, cancel, |_| async move {
          if let Some(artifact) = artifact {
            let state = ctx.engine_states.get_or_create(&job.engine_id, job.engine_type)?;
            let pairs = ctx.train_segment_pairs
                           .get_all(&|p: &TrainSegmentPair| p.engine_id == job.engine_id)
                           .await?;
            state.install(&artifact, &pairs).await?;
            if !pairs.is_empty() {
              info!("build {}: {} pares entrenados durante el build reaplicados", job.build_id, pairs.len());
            }
          }
          with_transaction(ctx.data_access.as_ref(), || async move {
            ctx.platform.build_completed(&job.build_id, train_size, confidence).await?;
            ctx.build_jobs.build_job_finished(&job.engine_id, &job.build_id, true).await?;
            Ok::<_, MachineError>(())
          }).await
        })
        .await?;
    info!("build {} completado ({} segmentos)", job.build_id, train_size);
    Ok(())
  }

  async fn cleanup(&self, job: &JobDefinition, status: JobCompletionStatus) {
    if status == JobCompletionStatus::Restarting || self.ctx.options.preserve_build_files {
      return;
    }
    if status != JobCompletionStatus::Faulted {
      delete_build_files(&self.ctx, &job.build_id).await;
    }
  }
}

/// Etapa seleccionada por `BuildStage`.
pub enum StageJob {
  Preprocess(PreprocessJob),
  Train(TrainJob),
  Postprocess(PostprocessJob),
}

impl StageJob {
  pub fn new(stage: BuildStage, ctx: Arc<BuildJobContext>) -> Self {
    match stage {
      BuildStage::Preprocess => StageJob::Preprocess(PreprocessJob::new(ctx)),
      BuildStage::Train => StageJob::Train(TrainJob::new(ctx)),
      BuildStage::Postprocess => StageJob::Postprocess(PostprocessJob::new(ctx)),
    }
  }

  fn inner(&self) -> &dyn BuildStageJob {
    match self {
      StageJob::Preprocess(job) => job,
      StageJob::Train(job) => job,
      StageJob::Postprocess(job) => job,
    }
  }
}

#[async_trait]
impl BuildStageJob for StageJob {
  async fn initialize(&self, job: &JobDefinition, cancel: &CancellationToken) -> Result<()> {
    self.inner().initialize(job, cancel).await
  }

  async fn do_work(&self, job: &JobDefinition, cancel: &CancellationToken) -> Result<()> {
    self.inner().do_work(job, cancel).await
  }

  async fn cleanup(&self, job: &JobDefinition, status: JobCompletionStatus) {
    self.inner().cleanup(job, status).await
  }
}
