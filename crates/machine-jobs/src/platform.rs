// Archivo: platform.rs
// Propósito: notificaciones hacia la plataforma. Cada llamada se serializa
// como mensaje de un outbox duradero; la entrega queda fuera de este crate.
use crate::errors::{MachineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use machine_domain::{BuildPhase, ProgressStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Estado de progreso de un build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildStatus {
  pub progress: ProgressStatus,
  /// Posición en la cola remota (1 = siguiente).
  pub queue_depth: Option<i32>,
  pub phases: Option<Vec<BuildPhase>>,
  pub started: Option<DateTime<Utc>>,
  pub completed: Option<DateTime<Utc>>,
}

impl BuildStatus {
  pub fn new(progress: ProgressStatus) -> Self {
    Self { progress,
           queue_depth: None,
           phases: None,
           started: None,
           completed: None }
  }

  pub fn step(step: i32) -> Self {
    Self::new(ProgressStatus::new(step, None, None))
  }

  pub fn with_queue_depth(mut self, queue_depth: i32) -> Self {
    self.queue_depth = Some(queue_depth);
    self
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum PlatformMessage {
  BuildStarted {
    build_id: String,
  },
  BuildCompleted {
    build_id: String,
    train_size: i32,
    confidence: f64,
  },
  BuildCanceled {
    build_id: String,
  },
  BuildFaulted {
    build_id: String,
    message: String,
  },
  BuildRestarting {
    build_id: String,
  },
  UpdateBuildStatus {
    build_id: String,
    status: BuildStatus,
  },
  UpdateBuildExecutionData {
    engine_id: String,
    build_id: String,
    execution_data: BTreeMap<String, String>,
  },
  IncrementTrainSize {
    engine_id: String,
    count: i32,
  },
}

impl PlatformMessage {
  pub fn method(&self) -> &'static str {
    match self {
      PlatformMessage::BuildStarted { .. } => "build_started",
      PlatformMessage::BuildCompleted { .. } => "build_completed",
      PlatformMessage::BuildCanceled { .. } => "build_canceled",
      PlatformMessage::BuildFaulted { .. } => "build_faulted",
      PlatformMessage::BuildRestarting { .. } => "build_restarting",
      PlatformMessage::UpdateBuildStatus { .. } => "update_build_status",
      PlatformMessage::UpdateBuildExecutionData { .. } => "update_build_execution_data",
      PlatformMessage::IncrementTrainSize { .. } => "increment_train_size",
    }
  }

  /// Clave de agrupación: los mensajes de un mismo grupo se entregan en
  /// orden.
  pub fn group_id(&self) -> &str {
    match self {
      PlatformMessage::BuildStarted { build_id }
      | PlatformMessage::BuildCompleted { build_id, .. }
      | PlatformMessage::BuildCanceled { build_id }
      | PlatformMessage::BuildFaulted { build_id, .. }
      | PlatformMessage::BuildRestarting { build_id }
      | PlatformMessage::UpdateBuildStatus { build_id, .. } => build_id,
      PlatformMessage::UpdateBuildExecutionData { engine_id, .. } | PlatformMessage::IncrementTrainSize { engine_id, .. } => {
        engine_id
      }
    }
  }
}

/// Mensaje tal como queda almacenado en el outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
  pub id: String,
  pub method: String,
  pub group_id: String,
  pub content: String,
  pub created: DateTime<Utc>,
}

#[async_trait]
pub trait Outbox: Send + Sync {
  async fn enqueue(&self, message: OutboxMessage) -> Result<()>;
}

/// Outbox en memoria para pruebas y cableado local.
#[derive(Debug, Default)]
pub struct MemoryOutbox {
  messages: Mutex<Vec<OutboxMessage>>,
}

impl MemoryOutbox {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, Vec<OutboxMessage>>> {
    self.messages.lock().map_err(|e| MachineError::Validation(format!("outbox envenenado: {e}")))
  }

  pub fn messages(&self) -> Vec<OutboxMessage> {
    self.lock().map(|m| m.clone()).unwrap_or_default()
  }

  /// Mensajes deserializados en orden de llegada.
  pub fn platform_messages(&self) -> Result<Vec<PlatformMessage>> {
    let messages = self.lock()?;
    messages.iter().map(|m| serde_json::from_str(&m.content).map_err(MachineError::from)).collect()
  }

  pub fn clear(&self) {
    if let Ok(mut messages) = self.lock() {
      messages.clear();
    }
  }
}

#[async_trait]
impl Outbox for MemoryOutbox {
  async fn enqueue(&self, message: OutboxMessage) -> Result<()> {
    self.lock()?.push(message);
    Ok(())
  }
}

/// Notificaciones del ciclo de vida de los builds.
#[async_trait]
pub trait PlatformService: Send + Sync {
  async fn build_started(&self, build_id: &str) -> Result<()>;

  async fn build_completed(&self, build_id: &str, train_size: i32, confidence: f64) -> Result<()>;

  async fn build_canceled(&self, build_id: &str) -> Result<()>;

  async fn build_faulted(&self, build_id: &str, message: &str) -> Result<()>;

  async fn build_restarting(&self, build_id: &str) -> Result<()>;

  async fn update_build_status(&self, build_id: &str, status: BuildStatus) -> Result<()>;

  async fn update_build_execution_data(&self,
                                       engine_id: &str,
                                       build_id: &str,
                                       execution_data: BTreeMap<String, String>)
                                       -> Result<()>;

  async fn increment_train_size(&self, engine_id: &str, count: i32) -> Result<()>;
}

pub struct OutboxPlatformService<O: Outbox> {
  outbox: O,
}

impl<O: Outbox> OutboxPlatformService<O> {
  pub fn new(outbox: O) -> Self {
    Self { outbox }
  }

  async fn send(&self, message: PlatformMessage) -> Result<()> {
    let stored = OutboxMessage { id: Uuid::new_v4().to_string(),
                                 method: message.method().to_string(),
                                 group_id: message.group_id().to_string(),
                                 content: serde_json::to_string(&message)?,
                                 created: Utc::now() };
    self.outbox.enqueue(stored).await
  }
}

#[async_trait]
impl<O: Outbox> PlatformService for OutboxPlatformService<O> {
  async fn build_started(&self, build_id: &str) -> Result<()> {
    self.send(PlatformMessage::BuildStarted { build_id: build_id.into() }).await
  }

  async fn build_completed(&self, build_id: &str, train_size: i32, confidence: f64) -> Result<()> {
    self.send(PlatformMessage::BuildCompleted { build_id: build_id.into(),
                                                train_size,
                                                confidence })
        .await
  }

  async fn build_canceled(&self, build_id: &str) -> Result<()> {
    self.send(PlatformMessage::BuildCanceled { build_id: build_id.into() }).await
  }

  async fn build_faulted(&self, build_id: &str, message: &str) -> Result<()> {
    self.send(PlatformMessage::BuildFaulted { build_id: build_id.into(),
                                              message: message.into() })
        .await
  }

  async fn build_restarting(&self, build_id: &str) -> Result<()> {
    self.send(PlatformMessage::BuildRestarting { build_id: build_id.into() }).await
  }

  async fn update_build_status(&self, build_id: &str, status: BuildStatus) -> Result<()> {
    self.send(PlatformMessage::UpdateBuildStatus { build_id: build_id.into(),
                                                   status })
        .await
  }

  async fn update_build_execution_data(&self,
                                       engine_id: &str,
                                       build_id: &str,
                                       execution_data: BTreeMap<String, String>)
                                       -> Result<()> {
    self.send(PlatformMessage::UpdateBuildExecutionData { engine_id: engine_id.into(),
                                                          build_id: build_id.into(),
                                                          execution_data })
        .await
  }

  async fn increment_train_size(&self, engine_id: &str, count: i32) -> Result<()> {
    self.send(PlatformMessage::IncrementTrainSize { engine_id: engine_id.into(),
                                                    count })
        .await
  }
}

#[async_trait]
impl<T: Outbox + ?Sized> Outbox for std::sync::Arc<T> {
  async fn enqueue(&self, message: OutboxMessage) -> Result<()> {
    (**self).enqueue(message).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  #[tokio::test]
  async fn messages_are_serialized_in_order() {
    let outbox = Arc::new(MemoryOutbox::new());
    let platform = OutboxPlatformService::new(outbox.clone());
    platform.build_started("b1").await.unwrap();
    platform.build_faulted("b1", "boom").await.unwrap();
    platform.increment_train_size("e1", 2).await.unwrap();

    let stored = outbox.messages();
    assert_eq!(stored[0].method, "build_started");
    assert_eq!(stored[2].group_id, "e1");
    assert_eq!(outbox.platform_messages().unwrap()[1],
               PlatformMessage::BuildFaulted { build_id: "b1".into(),
                                               message: "boom".into() });
  }
}
