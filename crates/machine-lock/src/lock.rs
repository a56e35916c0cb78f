// Archivo: lock.rs
// Propósito: lock lector/escritor distribuido sobre un documento por
// recurso. Toda transición es una actualización condicional del documento;
// la espera se despierta por cambios publicados o por el vencimiento más
// próximo de un lease, nunca por sondeo a intervalo fijo.
use crate::errors::{LockError, Result};
use crate::options::LockOptions;
use chrono::{DateTime, Utc};
use data_access::{Repository, Returning, Subscription};
use log::{debug, warn};
use machine_domain::{Lease, LockDocument, QueuedWriter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
  Reader,
  Writer,
}

/// Lock lector/escritor sobre un recurso identificado por `id`.
///
/// Los escritores se admiten en orden FIFO y nunca conviven con lectores
/// vigentes. Un lease vencido no bloquea a nadie: así se toleran los
/// procesos que murieron con el lock tomado.
#[derive(Clone)]
pub struct DistributedReaderWriterLock {
  id: String,
  host_id: String,
  locks: Arc<dyn Repository<LockDocument>>,
  options: LockOptions,
}

impl DistributedReaderWriterLock {
  pub fn new(id: &str, host_id: &str, locks: Arc<dyn Repository<LockDocument>>, options: LockOptions) -> Self {
    Self { id: id.to_string(),
           host_id: host_id.to_string(),
           locks,
           options }
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  /// Adquiere un lease de lector. `None` usa los valores de `LockOptions`.
  pub async fn reader_lock(&self,
                           lifetime: Option<Duration>,
                           timeout: Option<Duration>,
                           cancel: &CancellationToken)
                           -> Result<LockGuard> {
    let lifetime = self.lifetime(lifetime)?;
    let deadline = self.deadline(timeout);
    let lease_id = new_lease_id();
    if let Some(expires_at) = self.try_acquire_reader(&lease_id, lifetime).await? {
      return Ok(self.guard(lease_id, LockKind::Reader, expires_at));
    }

    let mut sub = self.subscribe().await?;
    loop {
      let doc = self.current_document(&mut sub)?;
      let now = Utc::now();
      if doc.is_available_for_reading(now) {
        if let Some(expires_at) = self.try_acquire_reader(&lease_id, lifetime).await? {
          return Ok(self.guard(lease_id, LockKind::Reader, expires_at));
        }
      }
      self.wait(&mut sub, &doc, now, deadline, cancel).await?;
    }
  }

  /// Adquiere un lease de escritor. Si no lo obtiene de inmediato se encola
  /// al final de la cola de escritores; cualquier fallo previo a la
  /// adquisición lo saca de la cola antes de propagar el error.
  pub async fn writer_lock(&self,
                           lifetime: Option<Duration>,
                           timeout: Option<Duration>,
                           cancel: &CancellationToken)
                           -> Result<LockGuard> {
    let lifetime = self.lifetime(lifetime)?;
    let deadline = self.deadline(timeout);
    let lease_id = new_lease_id();
    if let Some(expires_at) = self.try_acquire_writer(&lease_id, lifetime).await? {
      return Ok(self.guard(lease_id, LockKind::Writer, expires_at));
    }

    let waiter = QueuedWriter { id: lease_id.clone(),
                                host_id: self.host_id.clone() };
    let queued = self.locks
                     .update(&|d: &LockDocument| d.id == self.id,
                             &|d: &mut LockDocument| d.writer_queue.push(waiter.clone()),
                             Returning::Updated)
                     .await?;
    if queued.is_none() {
      return Err(LockError::NotFound(self.id.clone()));
    }
    debug!("escritor {} encolado en {}", lease_id, self.id);

    match self.wait_for_writer(&lease_id, lifetime, deadline, cancel).await {
      Ok(expires_at) => Ok(self.guard(lease_id, LockKind::Writer, expires_at)),
      Err(e) => {
        if let Err(cleanup) = self.dequeue(&lease_id).await {
          warn!("no se pudo quitar {} de la cola de {}: {}", lease_id, self.id, cleanup);
        }
        Err(e)
      }
    }
  }

  /// Ejecuta `f` con un lease de lector y lo libera en todas las salidas.
  pub async fn with_reader_lock<F, Fut, R, E>(&self,
                                              lifetime: Option<Duration>,
                                              timeout: Option<Duration>,
                                              cancel: &CancellationToken,
                                              f: F)
                                              -> std::result::Result<R, E>
    where F: FnOnce(CancellationToken) -> Fut,
          Fut: Future<Output = std::result::Result<R, E>>,
          E: From<LockError>
  {
    let guard = self.reader_lock(lifetime, timeout, cancel).await?;
    guard.run(cancel, f).await
  }

  /// Ejecuta `f` con un lease de escritor y lo libera en todas las salidas.
  pub async fn with_writer_lock<F, Fut, R, E>(&self,
                                              lifetime: Option<Duration>,
                                              timeout: Option<Duration>,
                                              cancel: &CancellationToken,
                                              f: F)
                                              -> std::result::Result<R, E>
    where F: FnOnce(CancellationToken) -> Fut,
          Fut: Future<Output = std::result::Result<R, E>>,
          E: From<LockError>
  {
    let guard = self.writer_lock(lifetime, timeout, cancel).await?;
    guard.run(cancel, f).await
  }

  async fn wait_for_writer(&self,
                           lease_id: &str,
                           lifetime: chrono::Duration,
                           deadline: Instant,
                           cancel: &CancellationToken)
                           -> Result<DateTime<Utc>> {
    let mut sub = self.subscribe().await?;
    loop {
      let doc = self.current_document(&mut sub)?;
      let now = Utc::now();
      if doc.is_available_for_writing(lease_id, now) {
        if let Some(expires_at) = self.try_acquire_writer(lease_id, lifetime).await? {
          return Ok(expires_at);
        }
      }
      self.wait(&mut sub, &doc, now, deadline, cancel).await?;
    }
  }

  async fn try_acquire_reader(&self, lease_id: &str, lifetime: chrono::Duration) -> Result<Option<DateTime<Utc>>> {
    let lease = self.lease(lease_id, lifetime);
    let expires_at = lease.expires_at;
    let acquired = self.locks
                       .update(&|d: &LockDocument| d.id == self.id && d.is_available_for_reading(Utc::now()),
                               &|d: &mut LockDocument| {
                                 d.prune_expired_readers(Utc::now());
                                 d.reader_locks.push(lease.clone());
                               },
                               Returning::Updated)
                       .await?;
    Ok(acquired.map(|_| expires_at))
  }

  async fn try_acquire_writer(&self, lease_id: &str, lifetime: chrono::Duration) -> Result<Option<DateTime<Utc>>> {
    let lease = self.lease(lease_id, lifetime);
    let expires_at = lease.expires_at;
    let acquired = self.locks
                       .update(&|d: &LockDocument| {
                                 d.id == self.id && d.is_available_for_writing(lease_id, Utc::now())
                               },
                               &|d: &mut LockDocument| {
                                 d.writer_lock = Some(lease.clone());
                                 d.writer_queue.retain(|w| w.id != lease_id);
                                 d.prune_expired_readers(Utc::now());
                               },
                               Returning::Updated)
                       .await?;
    Ok(acquired.map(|_| expires_at))
  }

  async fn dequeue(&self, lease_id: &str) -> Result<()> {
    self.locks
        .update(&|d: &LockDocument| d.id == self.id && d.is_queued(lease_id),
                &|d: &mut LockDocument| d.writer_queue.retain(|w| w.id != lease_id),
                Returning::Updated)
        .await?;
    Ok(())
  }

  /// Espera un cambio del documento, el vencimiento del lease vigente más
  /// próximo o el deadline, lo que ocurra primero.
  async fn wait(&self,
                sub: &mut Box<dyn Subscription<LockDocument>>,
                doc: &LockDocument,
                now: DateTime<Utc>,
                deadline: Instant,
                cancel: &CancellationToken)
                -> Result<()> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
      return Err(LockError::Timeout(self.id.clone()));
    }
    let wait = doc.next_expiry(now)
                  .and_then(|at| (at - now).to_std().ok())
                  .map_or(remaining, |until_expiry| until_expiry.min(remaining));
    tokio::select! {
      _ = cancel.cancelled() => Err(LockError::Canceled),
      changed = sub.wait_for_change(Some(wait)) => {
        changed?;
        Ok(())
      }
    }
  }

  async fn subscribe(&self) -> Result<Box<dyn Subscription<LockDocument>>> {
    let id = self.id.clone();
    Ok(self.locks.subscribe(Box::new(move |d: &LockDocument| d.id == id)).await?)
  }

  fn current_document(&self, sub: &mut Box<dyn Subscription<LockDocument>>) -> Result<LockDocument> {
    sub.change().entity.ok_or_else(|| LockError::NotFound(self.id.clone()))
  }

  fn lease(&self, lease_id: &str, lifetime: chrono::Duration) -> Lease {
    Lease { id: lease_id.to_string(),
            host_id: self.host_id.clone(),
            expires_at: Utc::now() + lifetime }
  }

  fn lifetime(&self, lifetime: Option<Duration>) -> Result<chrono::Duration> {
    let lifetime = lifetime.unwrap_or(self.options.default_lifetime);
    if lifetime.is_zero() {
      return Err(LockError::InvalidLifetime);
    }
    chrono::Duration::from_std(lifetime).map_err(|_| LockError::InvalidLifetime)
  }

  fn deadline(&self, timeout: Option<Duration>) -> Instant {
    Instant::now() + timeout.unwrap_or(self.options.acquire_timeout)
  }

  fn guard(&self, lease_id: String, kind: LockKind, expires_at: DateTime<Utc>) -> LockGuard {
    LockGuard { resource_id: self.id.clone(),
                lease_id,
                kind,
                expires_at,
                locks: self.locks.clone(),
                released: false }
  }
}

fn new_lease_id() -> String {
  Uuid::new_v4().simple().to_string()
}

/// Lease adquirido. `release` lo libera explícitamente; si el guard se
/// descarta sin liberar, la liberación se lanza en segundo plano y, sin
/// runtime, el lease queda hasta vencer.
pub struct LockGuard {
  resource_id: String,
  lease_id: String,
  kind: LockKind,
  expires_at: DateTime<Utc>,
  locks: Arc<dyn Repository<LockDocument>>,
  released: bool,
}

impl LockGuard {
  pub fn lease_id(&self) -> &str {
    &self.lease_id
  }

  pub fn kind(&self) -> LockKind {
    self.kind
  }

  pub fn expires_at(&self) -> DateTime<Utc> {
    self.expires_at
  }

  /// Libera el lease. Es idempotente frente a leases ya vencidos o
  /// retirados por `LockFactory::init`.
  pub async fn release(mut self) -> Result<()> {
    self.released = true;
    release_lease(self.locks.as_ref(), &self.resource_id, &self.lease_id, self.kind).await
  }

  /// Ejecuta `f` mientras el lease siga vigente y lo libera al salir. Si el
  /// lease vence antes, el token de `f` se cancela y se devuelve
  /// `LockError::Expired`.
  pub async fn run<F, Fut, R, E>(self, cancel: &CancellationToken, f: F) -> std::result::Result<R, E>
    where F: FnOnce(CancellationToken) -> Fut,
          Fut: Future<Output = std::result::Result<R, E>>,
          E: From<LockError>
  {
    let token = cancel.child_token();
    let remaining = (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    let result = match tokio::time::timeout(remaining, f(token.clone())).await {
      Ok(result) => result,
      Err(_) => {
        token.cancel();
        Err(LockError::Expired(self.resource_id.clone()).into())
      }
    };
    let resource_id = self.resource_id.clone();
    if let Err(e) = self.release().await {
      warn!("no se pudo liberar el lock {}: {}", resource_id, e);
    }
    result
  }
}

impl Drop for LockGuard {
  fn drop(&mut self) {
    if self.released {
      return;
    }
    let locks = self.locks.clone();
    let resource_id = self.resource_id.clone();
    let lease_id = self.lease_id.clone();
    let kind = self.kind;
    match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
        handle.spawn(async move {
                if let Err(e) = release_lease(locks.as_ref(), &resource_id, &lease_id, kind).await {
                  warn!("no se pudo liberar el lock {}: {}", resource_id, e);
                }
              });
      }
      Err(_) => warn!("lease {} sobre {} queda activo hasta vencer", lease_id, resource_id),
    }
  }
}

async fn release_lease(locks: &dyn Repository<LockDocument>,
                       resource_id: &str,
                       lease_id: &str,
                       kind: LockKind)
                       -> Result<()> {
  match kind {
    LockKind::Writer => {
      locks.update(&|d: &LockDocument| d.id == resource_id && d.holds_writer(lease_id),
                   &|d: &mut LockDocument| d.writer_lock = None,
                   Returning::Updated)
           .await?
    }
    LockKind::Reader => {
      locks.update(&|d: &LockDocument| d.id == resource_id && d.holds_reader(lease_id),
                   &|d: &mut LockDocument| d.reader_locks.retain(|l| l.id != lease_id),
                   Returning::Updated)
           .await?
    }
  };
  Ok(())
}
