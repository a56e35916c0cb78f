// Archivo: engine_state/service.rs
// Propósito: registro explícito de estados de motor por proceso y commit
// periódico bajo el lock de escritor de cada motor.
use super::model::ModelFactory;
use super::state::EngineState;
use crate::config::EngineOptions;
use crate::errors::{MachineError, Result};
use crate::recurrent::RecurrentTask;
use async_trait::async_trait;
use dashmap::DashMap;
use data_access::Repository;
use log::{error, warn};
use machine_domain::{Engine, EngineType};
use machine_lock::LockFactory;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct EngineStateService {
  states: DashMap<String, Arc<EngineState>>,
  factories: HashMap<EngineType, Arc<dyn ModelFactory>>,
  options: EngineOptions,
}

impl EngineStateService {
  pub fn new(factories: HashMap<EngineType, Arc<dyn ModelFactory>>, options: EngineOptions) -> Self {
    Self { states: DashMap::new(),
           factories,
           options }
  }

  pub fn options(&self) -> &EngineOptions {
    &self.options
  }

  pub fn factory(&self, engine_type: EngineType) -> Result<Arc<dyn ModelFactory>> {
    self.factories
        .get(&engine_type)
        .cloned()
        .ok_or_else(|| MachineError::Config(format!("sin fábrica de modelos para {engine_type}")))
  }

  /// Estado del motor, creado al primer acceso.
  pub fn get_or_create(&self, engine_id: &str, engine_type: EngineType) -> Result<Arc<EngineState>> {
    if let Some(state) = self.states.get(engine_id) {
      return Ok(state.clone());
    }
    let factory = self.factory(engine_type)?;
    let dir = self.options.engines_dir.join(engine_id);
    let state = self.states
                    .entry(engine_id.to_string())
                    .or_insert_with(|| Arc::new(EngineState::new(engine_id, dir, factory)));
    Ok(state.clone())
  }

  pub fn get(&self, engine_id: &str) -> Option<Arc<EngineState>> {
    self.states.get(engine_id).map(|s| s.clone())
  }

  pub fn remove(&self, engine_id: &str) -> Option<Arc<EngineState>> {
    self.states.remove(engine_id).map(|(_, s)| s)
  }

  pub fn len(&self) -> usize {
    self.states.len()
  }

  pub fn is_empty(&self) -> bool {
    self.states.is_empty()
  }

  fn snapshot(&self) -> Vec<Arc<EngineState>> {
    self.states.iter().map(|e| e.value().clone()).collect()
  }

  /// Aplica `commit` a cada estado cargado. Los fallos de un motor se
  /// registran y no detienen al resto. Devuelve cuántos se procesaron.
  pub async fn commit_all(&self, engines: &dyn Repository<Engine>, locks: &LockFactory) -> usize {
    let mut committed = 0;
    for state in self.snapshot() {
      if state.is_marked_for_deletion() || !state.is_loaded().await {
        continue;
      }
      match self.commit_one(&state, engines, locks).await {
        Ok(true) => committed += 1,
        Ok(false) => {}
        Err(e) => error!("error al hacer commit del motor {}: {}", state.engine_id(), e),
      }
    }
    committed
  }

  async fn commit_one(&self, state: &EngineState, engines: &dyn Repository<Engine>, locks: &LockFactory) -> Result<bool> {
    let lock = locks.get(state.engine_id());
    let cancel = CancellationToken::new();
    lock.with_writer_lock(Some(self.options.engine_commit_timeout), None, &cancel, |_| async move {
          let Some(engine) = engines.get_by_id(state.engine_id()).await? else {
            return Ok(false);
          };
          state.commit(engine.build_revision, self.options.inactive_engine_timeout).await?;
          Ok(true)
        })
        .await
  }

  /// Descarga todos los estados guardando cambios pendientes.
  pub async fn shutdown(&self) {
    for state in self.snapshot() {
      if let Err(e) = state.unload().await {
        warn!("no se pudo descargar el motor {}: {}", state.engine_id(), e);
      }
    }
    self.states.clear();
  }
}

/// Tarea recurrente que ejecuta `commit_all`.
pub struct EngineCommitService {
  states: Arc<EngineStateService>,
  engines: Arc<dyn Repository<Engine>>,
  locks: Arc<LockFactory>,
}

impl EngineCommitService {
  pub fn new(states: Arc<EngineStateService>, engines: Arc<dyn Repository<Engine>>, locks: Arc<LockFactory>) -> Self {
    Self { states, engines, locks }
  }
}

#[async_trait]
impl RecurrentTask for EngineCommitService {
  fn name(&self) -> &str {
    "commit de motores"
  }

  async fn run_once(&self, _cancel: &CancellationToken) -> Result<()> {
    self.states.commit_all(self.engines.as_ref(), self.locks.as_ref()).await;
    Ok(())
  }
}
