// Archivo: runner/mod.rs
// Propósito: estrategia de ejecución de los jobs de build. Un runner crea,
// encola, detiene y borra jobs; no conoce el estado del motor.
mod clearml;
mod local;

pub use clearml::{ClearMlBuildJobFactory, ClearMlBuildJobRunner, NmtClearMlBuildJobFactory,
                  SmtTransferClearMlBuildJobFactory};
pub use local::{LocalBuildJobRunner, LocalJobState};

use crate::errors::Result;
use async_trait::async_trait;
use machine_domain::{BuildJobRunnerType, BuildStage, EngineType};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

/// Todo lo necesario para ejecutar una etapa de un build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
  pub engine_type: EngineType,
  pub engine_id: String,
  pub build_id: String,
  pub stage: BuildStage,
  /// Carga específica de la etapa (corpus, métricas del entrenamiento...).
  pub data: Option<JsonValue>,
  pub options: Option<String>,
}

#[async_trait]
pub trait BuildJobRunner: Send + Sync {
  fn runner_type(&self) -> BuildJobRunnerType;

  async fn create_engine(&self, engine_id: &str, name: Option<&str>) -> Result<()>;

  async fn delete_engine(&self, engine_id: &str) -> Result<()>;

  /// Crea el job sin ponerlo en marcha y devuelve su id.
  async fn create_job(&self, job: JobDefinition) -> Result<String>;

  async fn delete_job(&self, job_id: &str) -> Result<bool>;

  async fn enqueue_job(&self, job_id: &str, engine_type: EngineType) -> Result<bool>;

  /// Pide la detención del job; si aún no arrancó, se descarta.
  async fn stop_job(&self, job_id: &str) -> Result<bool>;
}

/// Ejecuta un job local. Lo implementa la capa de etapas; el runner sólo
/// lo invoca.
#[async_trait]
pub trait BuildJobExecutor: Send + Sync {
  async fn execute(&self, job: &JobDefinition, cancel: CancellationToken) -> Result<()>;
}
