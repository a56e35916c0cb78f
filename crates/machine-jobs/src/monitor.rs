// Archivo: monitor.rs
// Propósito: reconciliación periódica de los builds que entrenan en la cola
// remota. Traduce el estado de cada tarea (en cola, en curso, completada,
// detenida, fallida) a transiciones del build y notificaciones.
use crate::config::BuildJobOptions;
use crate::errors::{MachineError, Result};
use crate::job::{build_dir, PostprocessPayload};
use crate::platform::{BuildStatus, PlatformService};
use crate::recurrent::RecurrentTask;
use crate::service::BuildJobService;
use crate::shared_files::SharedFileService;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use data_access::{with_transaction, DataAccessContext};
use log::{error, info, warn};
use machine_clearml::{ClearMlService, ClearMlTask, ClearMlTaskStatus, CONFIDENCE_VARIANT, SUMMARY_METRIC,
                      TRAIN_CORPUS_SIZE_VARIANT};
use machine_domain::{Build, BuildJobRunnerType, BuildJobState, BuildPhase, BuildPhaseStage, BuildStage, Engine,
                     EngineType, ProgressStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct ClearMlMonitorService {
  clearml: Arc<dyn ClearMlService>,
  build_jobs: Arc<BuildJobService>,
  platform: Arc<dyn PlatformService>,
  data_access: Arc<dyn DataAccessContext>,
  shared_files: Arc<dyn SharedFileService>,
  queues: Vec<(EngineType, String)>,
  queue_sizes: DashMap<EngineType, usize>,
  /// Último progreso enviado por build.
  last_status: DashMap<String, ProgressStatus>,
}

impl ClearMlMonitorService {
  pub fn new(clearml: Arc<dyn ClearMlService>,
             build_jobs: Arc<BuildJobService>,
             platform: Arc<dyn PlatformService>,
             data_access: Arc<dyn DataAccessContext>,
             shared_files: Arc<dyn SharedFileService>,
             options: &BuildJobOptions)
             -> Self {
    let mut queues: Vec<(EngineType, String)> = options.clearml_queues
                                                       .iter()
                                                       .map(|(t, q)| (*t, q.clone()))
                                                       .collect();
    queues.sort_by_key(|(t, _)| t.as_str());
    let queue_sizes = queues.iter().map(|(t, _)| (*t, 0)).collect();
    Self { clearml,
           build_jobs,
           platform,
           data_access,
           shared_files,
           queues,
           queue_sizes,
           last_status: DashMap::new() }
  }

  /// Tareas en espera en la cola del tipo de motor, según la última vuelta.
  pub fn queue_size(&self, engine_type: EngineType) -> usize {
    self.queue_sizes.get(&engine_type).map_or(0, |s| *s)
  }

  /// Una vuelta de reconciliación.
  pub async fn check_builds(&self) -> Result<()> {
    let engines = self.build_jobs.get_building_engines(BuildJobRunnerType::ClearMl).await?;
    if engines.is_empty() {
      return Ok(());
    }

    let job_ids: Vec<String> = engines.iter()
                                      .filter_map(|e| e.current_build.as_ref().map(|b| b.job_id.clone()))
                                      .collect();
    let tasks: HashMap<String, ClearMlTask> = self.clearml
                                                  .get_tasks_by_id(&job_ids)
                                                  .await?
                                                  .into_iter()
                                                  .map(|t| (t.id.clone(), t))
                                                  .collect();

    let mut positions: HashMap<EngineType, HashMap<String, usize>> = HashMap::new();
    for (engine_type, queue) in &self.queues {
      let mut candidates: HashMap<String, ClearMlTask> =
        engines.iter()
               .filter(|e| e.engine_type == *engine_type)
               .filter_map(|e| e.current_build.as_ref().and_then(|b| tasks.get(&b.job_id)))
               .map(|t| (t.id.clone(), t.clone()))
               .collect();
      for task in self.clearml.get_tasks_for_queue(queue).await? {
        candidates.entry(task.id.clone()).or_insert(task);
      }
      let queue_positions = queue_positions(candidates.into_values().collect());
      self.queue_sizes.insert(*engine_type, queue_positions.len());
      positions.insert(*engine_type, queue_positions);
    }

    for engine in &engines {
      let Some(build) = engine.current_build.as_ref() else {
        continue;
      };
      let Some(task) = tasks.get(&build.job_id) else {
        continue;
      };
      let position = positions.get(&engine.engine_type).and_then(|p| p.get(&build.build_id)).copied();
      if let Err(e) = self.reconcile(engine, build, task, position).await {
        error!("error al reconciliar el build {} del motor {}: {}", build.build_id, engine.engine_id, e);
      }
    }
    Ok(())
  }

  async fn reconcile(&self, engine: &Engine, build: &Build, task: &ClearMlTask, position: Option<usize>) -> Result<()> {
    if build.job_state == BuildJobState::Pending && task.status.is_waiting() {
      let mut status = BuildStatus::new(ProgressStatus::new(0, Some(0.0), None));
      status.queue_depth = position.map(|p| p as i32 + 1);
      self.update_status(&build.build_id, with_task_details(status, task)).await?;
    }

    if build.stage != BuildStage::Train {
      return Ok(());
    }

    if build.job_state == BuildJobState::Pending
       && matches!(task.status,
                   ClearMlTaskStatus::InProgress
                   | ClearMlTaskStatus::Stopped
                   | ClearMlTaskStatus::Failed
                   | ClearMlTaskStatus::Completed)
       && !self.train_job_started(engine, build).await?
    {
      return Ok(());
    }

    match task.status {
      ClearMlTaskStatus::InProgress => {
        let progress = ProgressStatus::new(task_step(task), task.progress(), task.property("message").map(str::to_string));
        let status = BuildStatus::new(progress).with_queue_depth(0);
        self.update_status(&build.build_id, with_task_details(status, task)).await?;
      }
      ClearMlTaskStatus::Completed => {
        let progress = ProgressStatus::new(task_step(task), Some(1.0), task.property("message").map(str::to_string));
        let status = BuildStatus::new(progress).with_queue_depth(0);
        self.update_status(&build.build_id, with_task_details(status, task)).await?;
        if !self.train_job_completed(engine, build, task).await? {
          self.train_job_canceled(engine, build).await?;
        }
      }
      ClearMlTaskStatus::Stopped => self.train_job_canceled(engine, build).await?,
      ClearMlTaskStatus::Failed => self.train_job_faulted(engine, build, &task.failure_message()).await?,
      _ => {}
    }
    Ok(())
  }

  async fn train_job_started(&self, engine: &Engine, build: &Build) -> Result<bool> {
    let started = with_transaction(self.data_access.as_ref(), || async {
                    if !self.build_jobs.build_job_started(&engine.engine_id, &build.build_id).await? {
                      return Ok::<_, MachineError>(false);
                    }
                    self.platform.build_started(&build.build_id).await?;
                    Ok(true)
                  }).await?;
    self.update_status(&build.build_id, BuildStatus::step(0).with_queue_depth(0)).await?;
    if started {
      info!("build {} iniciado en la cola remota", build.build_id);
    }
    Ok(started)
  }

  async fn train_job_completed(&self, engine: &Engine, build: &Build, task: &ClearMlTask) -> Result<bool> {
    let payload = PostprocessPayload { train_corpus_size: task.metric_by_key(&SUMMARY_METRIC, &TRAIN_CORPUS_SIZE_VARIANT)
                                                              .unwrap_or(0.0) as i32,
                                       confidence: task.metric_by_key(&SUMMARY_METRIC, &CONFIDENCE_VARIANT).unwrap_or(0.0) };
    self.last_status.remove(&build.build_id);
    let data = serde_json::to_value(payload)?;
    self.build_jobs
        .start_build_job(BuildJobRunnerType::Local,
                         engine.engine_type,
                         &engine.engine_id,
                         &build.build_id,
                         BuildStage::Postprocess,
                         Some(data),
                         build.options.clone())
        .await
  }

  async fn train_job_canceled(&self, engine: &Engine, build: &Build) -> Result<()> {
    let result = with_transaction(self.data_access.as_ref(), || async {
                   self.platform.build_canceled(&build.build_id).await?;
                   self.build_jobs.build_job_finished(&engine.engine_id, &build.build_id, false).await?;
                   Ok::<_, MachineError>(())
                 }).await;
    if result.is_ok() {
      info!("build {} cancelado", build.build_id);
    }
    if let Err(e) = self.shared_files.delete(&build_dir(&build.build_id)).await {
      warn!("no se pudieron borrar los datos del build {}: {}", build.build_id, e);
    }
    self.last_status.remove(&build.build_id);
    result
  }

  async fn train_job_faulted(&self, engine: &Engine, build: &Build, message: &str) -> Result<()> {
    let result = with_transaction(self.data_access.as_ref(), || async {
                   self.platform.build_faulted(&build.build_id, message).await?;
                   self.build_jobs.build_job_finished(&engine.engine_id, &build.build_id, false).await?;
                   Ok::<_, MachineError>(())
                 }).await;
    if result.is_ok() {
      error!("build {} fallido: {}", build.build_id, message);
    }
    self.last_status.remove(&build.build_id);
    result
  }

  /// Envía el estado salvo que su progreso sea igual al último enviado.
  async fn update_status(&self, build_id: &str, status: BuildStatus) -> Result<()> {
    if self.last_status.get(build_id).is_some_and(|last| *last == status.progress) {
      return Ok(());
    }
    let progress = status.progress.clone();
    self.platform.update_build_status(build_id, status).await?;
    self.last_status.insert(build_id.to_string(), progress);
    Ok(())
  }
}

#[async_trait]
impl RecurrentTask for ClearMlMonitorService {
  fn name(&self) -> &str {
    "monitor de ClearML"
  }

  async fn run_once(&self, _cancel: &CancellationToken) -> Result<()> {
    self.check_builds().await
  }
}

/// Posición (desde 0) de cada build entre las tareas en espera, ordenadas
/// por fecha de creación. Si un nombre aparece varias veces cuenta la
/// primera.
fn queue_positions(mut tasks: Vec<ClearMlTask>) -> HashMap<String, usize> {
  tasks.retain(|t| t.status.is_waiting());
  tasks.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
  let mut positions = HashMap::new();
  for (i, task) in tasks.into_iter().enumerate() {
    positions.entry(task.name).or_insert(i);
  }
  positions
}

fn task_step(task: &ClearMlTask) -> i32 {
  task.last_iteration.map_or(0, |i| i as i32)
}

fn with_task_details(mut status: BuildStatus, task: &ClearMlTask) -> BuildStatus {
  status.phases = Some(phases(task));
  status.started = task.started;
  status.completed = task.completed;
  status
}

fn phases(task: &ClearMlTask) -> Vec<BuildPhase> {
  let phase = |stage: BuildPhaseStage, prefix: &str| {
    let started: Option<DateTime<Utc>> = task.property_datetime(&format!("{prefix}_started"));
    BuildPhase { stage,
                 step: task.property_i32(&format!("{prefix}_step")),
                 step_count: task.property_i32(&format!("{prefix}_step_count")),
                 started }
  };
  vec![phase(BuildPhaseStage::Inference, "inference"), phase(BuildPhaseStage::Train, "train")]
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn waiting(id: &str, name: &str, minute: u32) -> ClearMlTask {
    let mut task = ClearMlTask::new(id, name, ClearMlTaskStatus::Queued);
    task.created = Utc.with_ymd_and_hms(2024, 3, 1, 10, minute, 0).single();
    task
  }

  #[test]
  fn positions_follow_creation_order_and_skip_running_tasks() {
    let mut running = waiting("t0", "b0", 0);
    running.status = ClearMlTaskStatus::InProgress;
    let positions = queue_positions(vec![waiting("t3", "b3", 30), running, waiting("t1", "b1", 10), waiting("t2", "b2", 20)]);
    assert_eq!(positions.len(), 3);
    assert_eq!(positions["b1"], 0);
    assert_eq!(positions["b2"], 1);
    assert_eq!(positions["b3"], 2);
  }

  #[test]
  fn duplicated_names_keep_the_first_position() {
    let positions = queue_positions(vec![waiting("t1", "b1", 10), waiting("t2", "b1", 20), waiting("t3", "b2", 30)]);
    assert_eq!(positions["b1"], 0);
    assert_eq!(positions["b2"], 2);
  }
}
