// Archivo: engine_service.rs
// Propósito: fachada de motores de traducción. Alta y baja de motores,
// builds, traducción y entrenamiento incremental, cada operación bajo el
// lock distribuido del motor.
use crate::engine_state::EngineStateService;
use crate::errors::{MachineError, Result};
use crate::job::CorpusPayload;
use crate::monitor::ClearMlMonitorService;
use crate::platform::PlatformService;
use crate::service::BuildJobService;
use data_access::{with_transaction, DataAccessContext, Repository};
use log::{info, warn};
use machine_domain::{BuildJobRunnerType, BuildJobState, BuildStage, Engine, EngineType, TrainSegmentPair};
use machine_lock::LockFactory;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct TranslationEngineService {
  engines: Arc<dyn Repository<Engine>>,
  train_segment_pairs: Arc<dyn Repository<TrainSegmentPair>>,
  data_access: Arc<dyn DataAccessContext>,
  build_jobs: Arc<BuildJobService>,
  platform: Arc<dyn PlatformService>,
  locks: Arc<LockFactory>,
  states: Arc<EngineStateService>,
  monitor: Option<Arc<ClearMlMonitorService>>,
}

impl TranslationEngineService {
  pub fn new(engines: Arc<dyn Repository<Engine>>,
             train_segment_pairs: Arc<dyn Repository<TrainSegmentPair>>,
             data_access: Arc<dyn DataAccessContext>,
             build_jobs: Arc<BuildJobService>,
             platform: Arc<dyn PlatformService>,
             locks: Arc<LockFactory>,
             states: Arc<EngineStateService>)
             -> Self {
    Self { engines,
           train_segment_pairs,
           data_access,
           build_jobs,
           platform,
           locks,
           states,
           monitor: None }
  }

  /// Publica los tamaños de cola que calcula el monitor.
  pub fn with_monitor(mut self, monitor: Arc<ClearMlMonitorService>) -> Self {
    self.monitor = Some(monitor);
    self
  }

  /// Da de alta el motor. Los modelos SMT siempre se persisten; el resto
  /// sólo si se pide.
  pub async fn create_engine(&self,
                             engine_id: &str,
                             name: Option<&str>,
                             engine_type: EngineType,
                             source_language: &str,
                             target_language: &str,
                             is_model_persisted: Option<bool>)
                             -> Result<Engine> {
    if engine_type == EngineType::SmtTransfer && is_model_persisted == Some(false) {
      return Err(MachineError::Validation("los motores SMT no admiten modelos sin persistir".into()));
    }
    let mut engine = Engine::new(engine_id, engine_type, source_language, target_language);
    engine.is_model_persisted = is_model_persisted.unwrap_or(engine_type != EngineType::Nmt);

    let engine = with_transaction(self.data_access.as_ref(), || async {
                   let engine = self.engines.insert(engine).await?;
                   self.build_jobs.create_engine(engine_id, name).await?;
                   Ok::<_, MachineError>(engine)
                 }).await?;
    self.locks.create(engine_id).await?;
    self.states.get_or_create(engine_id, engine_type)?.init_new()?;
    info!("motor {} ({}) creado", engine_id, engine_type);
    Ok(engine)
  }

  /// Borra el motor. Con el lock de escritor tomado se marca el estado, se
  /// cancela el build y se borran el modelo y el registro; el lock y los
  /// recursos de los runners se liberan después.
  pub async fn delete_engine(&self, engine_id: &str) -> Result<()> {
    let engine = self.engine(engine_id).await?;
    let state = self.states.get_or_create(engine_id, engine.engine_type)?;
    let lock = self.locks.get(engine_id);
    let cancel = CancellationToken::new();
    lock.with_writer_lock(None, None, &cancel, |_| async {
          state.mark_for_deletion();
          self.cancel_build_job(engine_id).await?;
          state.delete_data().await?;
          self.train_segment_pairs
              .delete_all(&|p: &TrainSegmentPair| p.engine_id == engine_id)
              .await?;
          self.engines.delete(&|e: &Engine| e.engine_id == engine_id).await?;
          Ok::<_, MachineError>(())
        })
        .await?;

    if let Err(e) = self.locks.delete(engine_id).await {
      warn!("no se pudo borrar el lock del motor {}: {}", engine_id, e);
    }
    self.build_jobs.delete_engine(engine_id).await?;
    self.states.remove(engine_id);
    info!("motor {} eliminado", engine_id);
    Ok(())
  }

  /// Encola el preproceso del build. Falla si el motor ya construye o
  /// cancela.
  pub async fn start_build(&self,
                           engine_id: &str,
                           build_id: &str,
                           corpus: CorpusPayload,
                           options: Option<String>)
                           -> Result<()> {
    let engine = self.engine(engine_id).await?;
    let data = serde_json::to_value(corpus)?;
    let started = self.build_jobs
                      .start_build_job(BuildJobRunnerType::Local,
                                       engine.engine_type,
                                       engine_id,
                                       build_id,
                                       BuildStage::Preprocess,
                                       Some(data),
                                       options)
                      .await?;
    if !started {
      return Err(MachineError::AlreadyBuilding(engine_id.to_string()));
    }
    self.touch(&engine).await;
    Ok(())
  }

  /// Cancela el build en curso y devuelve su id y el estado resultante.
  pub async fn cancel_build(&self, engine_id: &str) -> Result<(String, BuildJobState)> {
    let engine = self.engine(engine_id).await?;
    if engine.job_state() == BuildJobState::Canceling {
      return Err(MachineError::AlreadyCanceling(engine_id.to_string()));
    }
    let (build_id, state) = self.cancel_build_job(engine_id).await?;
    let Some(build_id) = build_id else {
      return Err(MachineError::NotBuilding(engine_id.to_string()));
    };
    self.touch(&engine).await;
    Ok((build_id, state))
  }

  /// Un build pendiente desaparece sin que ningún job llegue a notificarlo,
  /// así que la cancelación se informa aquí.
  async fn cancel_build_job(&self, engine_id: &str) -> Result<(Option<String>, BuildJobState)> {
    with_transaction(self.data_access.as_ref(), || async {
      let (build_id, state) = self.build_jobs.cancel_build_job(engine_id).await?;
      if let (Some(build_id), BuildJobState::None) = (build_id.as_deref(), state) {
        self.platform.build_canceled(build_id).await?;
      }
      Ok::<_, MachineError>((build_id, state))
    }).await
  }

  pub async fn translate(&self, engine_id: &str, segment: &str) -> Result<String> {
    let engine = self.built_engine(engine_id).await?;
    let state = self.states.get_or_create(engine_id, engine.engine_type)?;
    let lock = self.locks.get(engine_id);
    let cancel = CancellationToken::new();
    let translation = lock.with_reader_lock(None, None, &cancel, |_| async {
                            state.translate(engine.build_revision, segment).await
                          })
                          .await?;
    state.touch().await;
    Ok(translation)
  }

  /// Entrena un par de segmentos sobre el modelo cargado; los cambios se
  /// guardan en el siguiente commit. Con un build en marcha el par también
  /// se guarda para reaplicarlo al modelo que produzca.
  pub async fn train_segment(&self, engine_id: &str, source: &str, target: &str) -> Result<()> {
    let engine = self.built_engine(engine_id).await?;
    let state = self.states.get_or_create(engine_id, engine.engine_type)?;
    let lock = self.locks.get(engine_id);
    let cancel = CancellationToken::new();
    lock.with_writer_lock(None, None, &cancel, |_| async {
          let engine = self.built_engine(engine_id).await?;
          state.train_segment(engine.build_revision, source, target).await?;
          if engine.collect_train_segment_pairs {
            let id = Uuid::new_v4().simple().to_string();
            self.train_segment_pairs
                .insert(TrainSegmentPair::new(&id, engine_id, source, target))
                .await?;
          }
          Ok::<_, MachineError>(())
        })
        .await?;
    self.platform.increment_train_size(engine_id, 1).await?;
    state.touch().await;
    Ok(())
  }

  pub fn queue_size(&self, engine_type: EngineType) -> usize {
    self.monitor.as_ref().map_or(0, |m| m.queue_size(engine_type))
  }

  async fn engine(&self, engine_id: &str) -> Result<Engine> {
    self.engines
        .get_by_id(engine_id)
        .await?
        .ok_or_else(|| MachineError::EngineNotFound(engine_id.to_string()))
  }

  async fn built_engine(&self, engine_id: &str) -> Result<Engine> {
    let engine = self.engine(engine_id).await?;
    if engine.build_revision == 0 {
      return Err(MachineError::EngineNotBuilt(engine_id.to_string()));
    }
    Ok(engine)
  }

  async fn touch(&self, engine: &Engine) {
    if let Some(state) = self.states.get(&engine.engine_id) {
      state.touch().await;
    }
  }
}
