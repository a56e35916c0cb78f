// Archivo: task.rs
// Propósito: modelo de tarea tal como lo devuelve `tasks.get_all_ex`.
use crate::metrics::metric_key;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearMlTaskStatus {
  Created,
  Queued,
  InProgress,
  Stopped,
  Published,
  Publishing,
  Closed,
  Failed,
  Completed,
  #[serde(other)]
  Unknown,
}

impl ClearMlTaskStatus {
  /// Estados que cuentan como "en espera" para la posición en cola.
  pub fn is_waiting(&self) -> bool {
    matches!(self, ClearMlTaskStatus::Queued | ClearMlTaskStatus::Created)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearMlMetricsEvent {
  #[serde(default)]
  pub metric: Option<String>,
  #[serde(default)]
  pub variant: Option<String>,
  pub value: f64,
  #[serde(default)]
  pub min_value: Option<f64>,
  #[serde(default)]
  pub max_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearMlHyperParameter {
  #[serde(default)]
  pub section: Option<String>,
  #[serde(default)]
  pub name: Option<String>,
  #[serde(default)]
  pub value: String,
  #[serde(default, rename = "type")]
  pub kind: Option<String>,
  #[serde(default)]
  pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearMlTask {
  pub id: String,
  /// Id del build al que pertenece la tarea.
  pub name: String,
  pub status: ClearMlTaskStatus,
  #[serde(default)]
  pub project: Option<String>,
  #[serde(default)]
  pub last_iteration: Option<i64>,
  #[serde(default)]
  pub status_reason: Option<String>,
  #[serde(default)]
  pub status_message: Option<String>,
  #[serde(default)]
  pub created: Option<DateTime<Utc>>,
  #[serde(default)]
  pub started: Option<DateTime<Utc>>,
  #[serde(default)]
  pub completed: Option<DateTime<Utc>>,
  #[serde(default)]
  pub active_duration: Option<i64>,
  #[serde(default)]
  pub last_metrics: Option<HashMap<String, HashMap<String, ClearMlMetricsEvent>>>,
  #[serde(default)]
  pub hyperparams: Option<HashMap<String, HashMap<String, ClearMlHyperParameter>>>,
  #[serde(default)]
  pub runtime: Option<HashMap<String, JsonValue>>,
}

impl ClearMlTask {
  pub fn new(id: &str, name: &str, status: ClearMlTaskStatus) -> Self {
    Self { id: id.to_string(),
           name: name.to_string(),
           status,
           project: None,
           last_iteration: None,
           status_reason: None,
           status_message: None,
           created: None,
           started: None,
           completed: None,
           active_duration: None,
           last_metrics: None,
           hyperparams: None,
           runtime: None }
  }

  /// Valor de `runtime[key]`; ClearML lo envía como string o número.
  pub fn runtime_i64(&self, key: &str) -> Option<i64> {
    match self.runtime.as_ref()?.get(key)? {
      JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
      JsonValue::String(s) => s.trim().parse().ok(),
      _ => None,
    }
  }

  /// Progreso reportado por el script, en [0, 1].
  pub fn progress(&self) -> Option<f64> {
    self.runtime_i64("progress").map(|p| p as f64 / 100.0)
  }

  /// Hiperparámetro `properties/{name}` publicado por el script.
  pub fn property(&self, name: &str) -> Option<&str> {
    self.hyperparams
        .as_ref()?
        .get("properties")?
        .get(name)
        .map(|p| p.value.as_str())
  }

  pub fn property_i32(&self, name: &str) -> Option<i32> {
    self.property(name)?.trim().parse().ok()
  }

  pub fn property_datetime(&self, name: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(self.property(name)?.trim()).ok()
                                                           .map(|d| d.with_timezone(&Utc))
  }

  /// Busca una métrica por nombre visible; las claves se hashean antes.
  pub fn metric(&self, metric: &str, variant: &str) -> Option<f64> {
    self.metric_by_key(&metric_key(metric), &metric_key(variant))
  }

  /// Busca una métrica por claves ya hasheadas (ver `crate::metrics`).
  pub fn metric_by_key(&self, metric_hash: &str, variant_hash: &str) -> Option<f64> {
    self.last_metrics
        .as_ref()?
        .get(metric_hash)?
        .get(variant_hash)
        .map(|e| e.value)
  }

  /// `"{status_reason} : {status_message}"`, el texto que se propaga cuando
  /// la tarea falla.
  pub fn failure_message(&self) -> String {
    format!("{} : {}",
            self.status_reason.as_deref().unwrap_or_default(),
            self.status_message.as_deref().unwrap_or_default())
  }
}
