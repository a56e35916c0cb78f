// Archivo: factory.rs
// Propósito: alta/baja de documentos de lock y recuperación de los leases
// que este host dejó huérfanos al caerse.
use crate::errors::Result;
use crate::lock::DistributedReaderWriterLock;
use crate::options::LockOptions;
use data_access::{DataAccessError, Repository};
use log::info;
use machine_domain::LockDocument;
use std::sync::Arc;

pub struct LockFactory {
  locks: Arc<dyn Repository<LockDocument>>,
  host_id: String,
  options: LockOptions,
}

impl LockFactory {
  pub fn new(locks: Arc<dyn Repository<LockDocument>>, host_id: &str, options: LockOptions) -> Self {
    Self { locks,
           host_id: host_id.to_string(),
           options }
  }

  pub fn host_id(&self) -> &str {
    &self.host_id
  }

  /// Se ejecuta una vez al arrancar el host: quita las entradas de cola, el
  /// escritor y los lectores que pertenecen a este host.
  pub async fn init(&self) -> Result<()> {
    let host = self.host_id.as_str();
    let dequeued = self.locks
                       .update_all(&|d: &LockDocument| d.writer_queue.iter().any(|w| w.host_id == host),
                                   &|d: &mut LockDocument| d.writer_queue.retain(|w| w.host_id != host))
                       .await?;
    let writers = self.locks
                      .update_all(&|d: &LockDocument| d.writer_lock.as_ref().is_some_and(|l| l.host_id == host),
                                  &|d: &mut LockDocument| d.writer_lock = None)
                      .await?;
    let readers = self.locks
                      .update_all(&|d: &LockDocument| d.reader_locks.iter().any(|l| l.host_id == host),
                                  &|d: &mut LockDocument| d.reader_locks.retain(|l| l.host_id != host))
                      .await?;
    if dequeued + writers + readers > 0 {
      info!("host {}: recuperados {} documentos en cola, {} con escritor y {} con lectores",
            host, dequeued, writers, readers);
    }
    Ok(())
  }

  /// Garantiza que exista el documento del recurso y devuelve su lock.
  pub async fn create(&self, id: &str) -> Result<DistributedReaderWriterLock> {
    match self.locks.insert(LockDocument::new(id)).await {
      Ok(_) | Err(DataAccessError::DuplicateKey(_)) => Ok(self.get(id)),
      Err(e) => Err(e.into()),
    }
  }

  /// Handle sobre un documento existente; no toca el almacenamiento.
  pub fn get(&self, id: &str) -> DistributedReaderWriterLock {
    DistributedReaderWriterLock::new(id, &self.host_id, self.locks.clone(), self.options.clone())
  }

  pub async fn delete(&self, id: &str) -> Result<bool> {
    Ok(self.locks.delete(&|d: &LockDocument| d.id == id).await?.is_some())
  }
}
