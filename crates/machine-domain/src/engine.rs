// engine.rs
// Motor de traducción y build embebido. El build actual es la máquina de
// estados: su ausencia equivale al estado terminal implícito `None`.
use crate::DomainError;
use data_access::Entity;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineType {
  SmtTransfer,
  Nmt,
  Echo,
}

impl EngineType {
  pub const ALL: [EngineType; 3] = [EngineType::SmtTransfer, EngineType::Nmt, EngineType::Echo];

  /// Nombre en minúsculas usado en rutas, colas y variables de entorno.
  pub fn as_str(&self) -> &'static str {
    match self {
      EngineType::SmtTransfer => "smt_transfer",
      EngineType::Nmt => "nmt",
      EngineType::Echo => "echo",
    }
  }
}

impl fmt::Display for EngineType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for EngineType {
  type Err = DomainError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
      "smt_transfer" | "smttransfer" => Ok(EngineType::SmtTransfer),
      "nmt" => Ok(EngineType::Nmt),
      "echo" => Ok(EngineType::Echo),
      other => Err(DomainError::UnknownValue { kind: "EngineType",
                                               value: other.to_string() }),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildStage {
  Preprocess,
  Train,
  Postprocess,
}

/// Estado del job del build. `None` sólo aparece como resultado de una
/// cancelación; un `Build` almacenado nunca lo tiene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildJobState {
  None,
  Pending,
  Active,
  Canceling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildJobRunnerType {
  /// Planificador en proceso.
  Local,
  /// Cola remota de tareas de ML.
  ClearMl,
}

impl FromStr for BuildJobRunnerType {
  type Err = DomainError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "local" | "hangfire" => Ok(BuildJobRunnerType::Local),
      "clearml" | "clear_ml" => Ok(BuildJobRunnerType::ClearMl),
      other => Err(DomainError::UnknownValue { kind: "BuildJobRunnerType",
                                               value: other.to_string() }),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
  pub build_id: String,
  pub job_id: String,
  pub build_job_runner: BuildJobRunnerType,
  pub stage: BuildStage,
  pub job_state: BuildJobState,
  pub options: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Engine {
  pub engine_id: String,
  pub engine_type: EngineType,
  pub source_language: String,
  pub target_language: String,
  /// Se incrementa sólo cuando un build termina con éxito.
  pub build_revision: i64,
  pub is_model_persisted: bool,
  pub current_build: Option<Build>,
  /// Activo desde el preproceso hasta que el build termina: los pares
  /// entrenados mientras tanto se guardan para reaplicarlos al modelo nuevo.
  #[serde(default)]
  pub collect_train_segment_pairs: bool,
  pub revision: i64,
}

impl Engine {
  pub fn new(engine_id: &str, engine_type: EngineType, source_language: &str, target_language: &str) -> Self {
    Self { engine_id: engine_id.to_string(),
           engine_type,
           source_language: source_language.to_string(),
           target_language: target_language.to_string(),
           build_revision: 0,
           is_model_persisted: false,
           current_build: None,
           collect_train_segment_pairs: false,
           revision: 0 }
  }

  pub fn is_building(&self) -> bool {
    self.current_build.is_some()
  }

  /// `true` si el build actual tiene el id dado y está en alguno de los
  /// estados indicados.
  pub fn build_matches(&self, build_id: &str, states: &[BuildJobState]) -> bool {
    self.current_build
        .as_ref()
        .is_some_and(|b| b.build_id == build_id && states.contains(&b.job_state))
  }

  pub fn job_state(&self) -> BuildJobState {
    self.current_build.as_ref().map_or(BuildJobState::None, |b| b.job_state)
  }
}

impl Entity for Engine {
  fn id(&self) -> &str {
    &self.engine_id
  }

  fn revision(&self) -> i64 {
    self.revision
  }

  fn set_revision(&mut self, revision: i64) {
    self.revision = revision;
  }
}
