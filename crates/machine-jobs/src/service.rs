// Archivo: service.rs
// Propósito: máquina de estados de los builds. Es el único componente que
// escribe `Engine::current_build` y `Engine::build_revision`; cada
// transición es una actualización condicional sobre el estado previo
// esperado.
use crate::errors::{MachineError, Result};
use crate::runner::{BuildJobRunner, JobDefinition};
use data_access::{Repository, Returning};
use log::{info, warn};
use machine_domain::{Build, BuildJobRunnerType, BuildJobState, BuildStage, Engine, EngineType};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

pub struct BuildJobService {
  runners: HashMap<BuildJobRunnerType, Arc<dyn BuildJobRunner>>,
  engines: Arc<dyn Repository<Engine>>,
}

impl BuildJobService {
  pub fn new(runners: Vec<Arc<dyn BuildJobRunner>>, engines: Arc<dyn Repository<Engine>>) -> Self {
    let runners = runners.into_iter().map(|r| (r.runner_type(), r)).collect();
    Self { runners, engines }
  }

  fn runner(&self, runner_type: BuildJobRunnerType) -> Result<&Arc<dyn BuildJobRunner>> {
    self.runners
        .get(&runner_type)
        .ok_or_else(|| MachineError::Config(format!("runner {runner_type:?} no registrado")))
  }

  pub async fn is_engine_building(&self, engine_id: &str) -> Result<bool> {
    Ok(self.engines
           .exists(&|e: &Engine| e.engine_id == engine_id && e.current_build.is_some())
           .await?)
  }

  pub async fn get_building_engines(&self, runner: BuildJobRunnerType) -> Result<Vec<Engine>> {
    Ok(self.engines
           .get_all(&|e: &Engine| e.current_build.as_ref().is_some_and(|b| b.build_job_runner == runner))
           .await?)
  }

  pub async fn get_build(&self, engine_id: &str, build_id: &str) -> Result<Option<Build>> {
    let engine = self.engines
                     .get(&|e: &Engine| {
                       e.engine_id == engine_id && e.current_build.as_ref().is_some_and(|b| b.build_id == build_id)
                     })
                     .await?;
    Ok(engine.and_then(|e| e.current_build))
  }

  pub async fn create_engine(&self, engine_id: &str, name: Option<&str>) -> Result<()> {
    for runner in self.runners.values() {
      runner.create_engine(engine_id, name).await?;
    }
    Ok(())
  }

  pub async fn delete_engine(&self, engine_id: &str) -> Result<()> {
    for runner in self.runners.values() {
      runner.delete_engine(engine_id).await?;
    }
    Ok(())
  }

  /// Crea el job de la etapa y lo vincula al motor. Devuelve `false` si el
  /// motor ya construía (Preprocess) o si el build fue cancelado (resto de
  /// etapas); en ambos casos el job creado se borra.
  #[allow(clippy::too_many_arguments)]
  pub async fn start_build_job(&self,
                               runner_type: BuildJobRunnerType,
                               engine_type: EngineType,
                               engine_id: &str,
                               build_id: &str,
                               stage: BuildStage,
                               data: Option<JsonValue>,
                               options: Option<String>)
                               -> Result<bool> {
    let runner = self.runner(runner_type)?;
    let job_id = runner.create_job(JobDefinition { engine_type,
                                                   engine_id: engine_id.to_string(),
                                                   build_id: build_id.to_string(),
                                                   stage,
                                                   data,
                                                   options: options.clone() })
                       .await?;

    match self.link_job(runner.as_ref(), engine_id, build_id, &job_id, stage, options).await {
      Ok(true) => Ok(true),
      Ok(false) => {
        self.discard_job(runner.as_ref(), &job_id).await;
        Ok(false)
      }
      Err(e) => {
        self.discard_job(runner.as_ref(), &job_id).await;
        Err(e)
      }
    }
  }

  async fn link_job(&self,
                    runner: &dyn BuildJobRunner,
                    engine_id: &str,
                    build_id: &str,
                    job_id: &str,
                    stage: BuildStage,
                    options: Option<String>)
                    -> Result<bool> {
    let build = Build { build_id: build_id.to_string(),
                        job_id: job_id.to_string(),
                        build_job_runner: runner.runner_type(),
                        stage,
                        job_state: BuildJobState::Pending,
                        options };
    let filter = |e: &Engine| {
      e.engine_id == engine_id
      && match (&e.current_build, stage) {
        (None, BuildStage::Preprocess) => true,
        (Some(b), s) if s != BuildStage::Preprocess => b.build_id == build_id && b.job_state != BuildJobState::Canceling,
        _ => false,
      }
    };
    let engine = self.engines
                     .update(&filter, &|e: &mut Engine| e.current_build = Some(build.clone()), Returning::Updated)
                     .await?;
    let Some(engine) = engine else {
      return Ok(false);
    };
    runner.enqueue_job(job_id, engine.engine_type).await?;
    info!("build {} del motor {}: etapa {:?} encolada como {}", build_id, engine_id, stage, job_id);
    Ok(true)
  }

  async fn discard_job(&self, runner: &dyn BuildJobRunner, job_id: &str) {
    if let Err(e) = runner.delete_job(job_id).await {
      warn!("no se pudo borrar el job huérfano {}: {}", job_id, e);
    }
  }

  /// Cancela el build actual. Un build pendiente se elimina sin rastro
  /// (`BuildJobState::None`); uno activo pasa a `Canceling` y se pide la
  /// detención del job.
  pub async fn cancel_build_job(&self, engine_id: &str) -> Result<(Option<String>, BuildJobState)> {
    let original = self.engines
                       .update(&|e: &Engine| e.engine_id == engine_id && e.job_state() == BuildJobState::Pending,
                               &|e: &mut Engine| {
                                 e.current_build = None;
                                 e.collect_train_segment_pairs = false;
                               },
                               Returning::Original)
                       .await?;
    if let Some(build) = original.and_then(|e| e.current_build) {
      self.runner(build.build_job_runner)?.delete_job(&build.job_id).await?;
      info!("build {} cancelado antes de empezar", build.build_id);
      return Ok((Some(build.build_id), BuildJobState::None));
    }

    let updated = self.engines
                      .update(&|e: &Engine| e.engine_id == engine_id && e.job_state() == BuildJobState::Active,
                              &|e: &mut Engine| {
                                if let Some(b) = e.current_build.as_mut() {
                                  b.job_state = BuildJobState::Canceling;
                                }
                              },
                              Returning::Updated)
                      .await?;
    if let Some(build) = updated.and_then(|e| e.current_build) {
      self.runner(build.build_job_runner)?.stop_job(&build.job_id).await?;
      info!("build {} en cancelación", build.build_id);
      return Ok((Some(build.build_id), BuildJobState::Canceling));
    }

    Ok((None, BuildJobState::None))
  }

  /// Pending → Active. `false` indica que el build ya no existe o fue
  /// cancelado: el llamador no debe continuar.
  pub async fn build_job_started(&self, engine_id: &str, build_id: &str) -> Result<bool> {
    let engine = self.engines
                     .update(&|e: &Engine| e.engine_id == engine_id && e.build_matches(build_id, &[BuildJobState::Pending]),
                             &|e: &mut Engine| {
                               if let Some(b) = e.current_build.as_mut() {
                                 b.job_state = BuildJobState::Active;
                               }
                             },
                             Returning::Updated)
                     .await?;
    Ok(engine.is_some())
  }

  /// Retira el build y deja de recoger pares; sólo un build completo
  /// incrementa la revisión.
  pub async fn build_job_finished(&self, engine_id: &str, build_id: &str, build_complete: bool) -> Result<bool> {
    let engine = self.engines
                     .update(&|e: &Engine| {
                               e.engine_id == engine_id
                               && e.current_build.as_ref().is_some_and(|b| b.build_id == build_id)
                             },
                             &|e: &mut Engine| {
                               e.current_build = None;
                               e.collect_train_segment_pairs = false;
                               if build_complete {
                                 e.build_revision += 1;
                               }
                             },
                             Returning::Updated)
                     .await?;
    Ok(engine.is_some())
  }

  /// Active → Pending tras un fallo de infraestructura. El job existente
  /// se reentrega; no se crea otro. Un build en `Canceling` no se toca.
  pub async fn build_job_restarting(&self, engine_id: &str, build_id: &str) -> Result<bool> {
    let engine = self.engines
                     .update(&|e: &Engine| e.engine_id == engine_id && e.build_matches(build_id, &[BuildJobState::Active]),
                             &|e: &mut Engine| {
                               if let Some(b) = e.current_build.as_mut() {
                                 b.job_state = BuildJobState::Pending;
                               }
                             },
                             Returning::Updated)
                     .await?;
    Ok(engine.is_some())
  }
}
