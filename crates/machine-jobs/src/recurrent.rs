// Archivo: recurrent.rs
// Propósito: ejecución periódica de tareas de fondo hasta el apagado.
use crate::errors::Result;
use async_trait::async_trait;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait RecurrentTask: Send + Sync {
  fn name(&self) -> &str;

  async fn run_once(&self, cancel: &CancellationToken) -> Result<()>;
}

/// Ejecuta `task` cada `period`. Un error en una vuelta se registra y no
/// detiene el bucle.
pub fn spawn_recurrent(task: Arc<dyn RecurrentTask>, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
  tokio::spawn(async move {
    info!("{}: iniciado cada {:?}", task.name(), period);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
      tokio::select! {
        biased;
        _ = shutdown.cancelled() => break,
        _ = interval.tick() => {
          if let Err(e) = task.run_once(&shutdown).await {
            error!("{}: {}", task.name(), e);
          }
        }
      }
    }
    info!("{}: detenido", task.name());
  })
}
