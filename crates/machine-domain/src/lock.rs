// lock.rs
// Documento de coordinación de un recurso: escritor actual, lectores y cola
// FIFO de escritores en espera. Un lease vencido cuenta como liberado aunque
// nadie lo haya quitado.
use chrono::{DateTime, Utc};
use data_access::Entity;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
  /// Aleatorio por adquisición, no por proceso.
  pub id: String,
  pub host_id: String,
  pub expires_at: DateTime<Utc>,
}

impl Lease {
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.expires_at <= now
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedWriter {
  pub id: String,
  pub host_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDocument {
  pub id: String,
  pub writer_lock: Option<Lease>,
  pub reader_locks: Vec<Lease>,
  pub writer_queue: Vec<QueuedWriter>,
  pub revision: i64,
}

impl LockDocument {
  pub fn new(id: &str) -> Self {
    Self { id: id.to_string(),
           writer_lock: None,
           reader_locks: Vec::new(),
           writer_queue: Vec::new(),
           revision: 0 }
  }

  fn has_live_writer(&self, now: DateTime<Utc>) -> bool {
    self.writer_lock.as_ref().is_some_and(|l| !l.is_expired(now))
  }

  /// Los lectores nuevos nunca se adelantan a un escritor en cola.
  pub fn is_available_for_reading(&self, now: DateTime<Utc>) -> bool {
    !self.has_live_writer(now) && self.writer_queue.is_empty()
  }

  pub fn is_available_for_writing(&self, lease_id: &str, now: DateTime<Utc>) -> bool {
    !self.has_live_writer(now)
    && self.reader_locks.iter().all(|l| l.is_expired(now))
    && self.writer_queue.first().map_or(true, |w| w.id == lease_id)
  }

  /// Vencimiento más próximo entre los leases aún vigentes. Es el instante
  /// en que un bloqueado debe reintentar aunque nadie publique cambios.
  pub fn next_expiry(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    self.writer_lock
        .iter()
        .chain(self.reader_locks.iter())
        .filter(|l| !l.is_expired(now))
        .map(|l| l.expires_at)
        .min()
  }

  pub fn prune_expired_readers(&mut self, now: DateTime<Utc>) {
    self.reader_locks.retain(|l| !l.is_expired(now));
  }

  pub fn is_queued(&self, lease_id: &str) -> bool {
    self.writer_queue.iter().any(|w| w.id == lease_id)
  }

  pub fn holds_writer(&self, lease_id: &str) -> bool {
    self.writer_lock.as_ref().is_some_and(|l| l.id == lease_id)
  }

  pub fn holds_reader(&self, lease_id: &str) -> bool {
    self.reader_locks.iter().any(|l| l.id == lease_id)
  }
}

impl Entity for LockDocument {
  fn id(&self) -> &str {
    &self.id
  }

  fn revision(&self) -> i64 {
    self.revision
  }

  fn set_revision(&mut self, revision: i64) {
    self.revision = revision;
  }
}
