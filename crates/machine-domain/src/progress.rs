// progress.rs
// Progreso de un build tal como se informa a la plataforma.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressStatus {
  pub step: i32,
  /// Fracción en [0, 1].
  pub percent_completed: Option<f64>,
  pub message: Option<String>,
}

impl ProgressStatus {
  pub fn new(step: i32, percent_completed: Option<f64>, message: Option<String>) -> Self {
    Self { step,
           percent_completed,
           message }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildPhaseStage {
  Train,
  Inference,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPhase {
  pub stage: BuildPhaseStage,
  pub step: Option<i32>,
  pub step_count: Option<i32>,
  pub started: Option<DateTime<Utc>>,
}
