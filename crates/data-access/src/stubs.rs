// Archivo: stubs.rs
// Propósito: implementaciones en memoria del repositorio y del contexto
// transaccional, para pruebas y wiring rápido. No son durables.
use crate::entity::{Entity, EntityChange, EntityChangeType};
use crate::errors::{DataAccessError, Result};
use crate::repository::{DataAccessContext, Repository, Returning, Subscription};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

struct Subscriber<T> {
  filter: Box<dyn Fn(&T) -> bool + Send + Sync>,
  sender: watch::Sender<EntityChange<T>>,
}

struct State<T> {
  entities: IndexMap<String, T>,
  subscribers: Vec<Subscriber<T>>,
}

impl<T: Entity> State<T> {
  /// Publica un cambio a los suscriptores cuyo filtro coincide con la
  /// entidad antes o después de la mutación. Se llama con el mutex tomado,
  /// así el orden de publicación es el de las mutaciones.
  fn publish(&mut self, change_type: EntityChangeType, before: Option<&T>, after: Option<&T>) {
    self.subscribers.retain(|s| !s.sender.is_closed());
    for sub in &self.subscribers {
      let matches = before.is_some_and(|e| (sub.filter)(e)) || after.is_some_and(|e| (sub.filter)(e));
      if matches {
        sub.sender.send_replace(EntityChange::new(change_type, after.cloned()));
      }
    }
  }
}

/// Repositorio en memoria respaldado por un `IndexMap` (orden de inserción
/// estable) y canales `watch` para las suscripciones.
pub struct MemoryRepository<T: Entity> {
  state: Mutex<State<T>>,
}

impl<T: Entity> MemoryRepository<T> {
  pub fn new() -> Self {
    Self { state: Mutex::new(State { entities: IndexMap::new(),
                                     subscribers: Vec::new() }) }
  }

  /// Helper para mapear `Mutex::lock()` en un `Result` con
  /// `DataAccessError::Storage`.
  fn lock(&self) -> Result<MutexGuard<'_, State<T>>> {
    self.state
        .lock()
        .map_err(|e| DataAccessError::Storage(format!("mutex poisoned: {:?}", e)))
  }

  /// Número de entidades almacenadas.
  pub fn len(&self) -> usize {
    self.lock().map(|s| s.entities.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl<T: Entity> Default for MemoryRepository<T> {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl<T: Entity> Repository<T> for MemoryRepository<T> {
  async fn get(&self, filter: &(dyn for<'e> Fn(&'e T) -> bool + Send + Sync)) -> Result<Option<T>> {
    let state = self.lock()?;
    Ok(state.entities.values().find(|e| filter(e)).cloned())
  }

  async fn get_all(&self, filter: &(dyn for<'e> Fn(&'e T) -> bool + Send + Sync)) -> Result<Vec<T>> {
    let state = self.lock()?;
    Ok(state.entities.values().filter(|e| filter(e)).cloned().collect())
  }

  async fn insert(&self, mut entity: T) -> Result<T> {
    let mut state = self.lock()?;
    if state.entities.contains_key(entity.id()) {
      return Err(DataAccessError::DuplicateKey(entity.id().to_string()));
    }
    entity.set_revision(1);
    state.entities.insert(entity.id().to_string(), entity.clone());
    state.publish(EntityChangeType::Insert, None, Some(&entity));
    Ok(entity)
  }

  async fn update(&self,
                  filter: &(dyn for<'e> Fn(&'e T) -> bool + Send + Sync),
                  update: &(dyn for<'e> Fn(&'e mut T) + Send + Sync),
                  returning: Returning)
                  -> Result<Option<T>> {
    let mut state = self.lock()?;
    let Some(entity) = state.entities.values_mut().find(|e| filter(e)) else {
      return Ok(None);
    };
    let original = entity.clone();
    update(entity);
    entity.set_revision(original.revision() + 1);
    let updated = entity.clone();
    state.publish(EntityChangeType::Update, Some(&original), Some(&updated));
    Ok(Some(match returning {
              Returning::Original => original,
              Returning::Updated => updated,
            }))
  }

  async fn update_all(&self,
                      filter: &(dyn for<'e> Fn(&'e T) -> bool + Send + Sync),
                      update: &(dyn for<'e> Fn(&'e mut T) + Send + Sync))
                      -> Result<usize> {
    let mut state = self.lock()?;
    let mut changes = Vec::new();
    for entity in state.entities.values_mut().filter(|e| filter(e)) {
      let original = entity.clone();
      update(entity);
      entity.set_revision(original.revision() + 1);
      changes.push((original, entity.clone()));
    }
    for (original, updated) in &changes {
      state.publish(EntityChangeType::Update, Some(original), Some(updated));
    }
    Ok(changes.len())
  }

  async fn delete(&self, filter: &(dyn for<'e> Fn(&'e T) -> bool + Send + Sync)) -> Result<Option<T>> {
    let mut state = self.lock()?;
    let Some(index) = state.entities.values().position(|e| filter(e)) else {
      return Ok(None);
    };
    let removed = state.entities.shift_remove_index(index).map(|(_, e)| e);
    if let Some(entity) = &removed {
      state.publish(EntityChangeType::Delete, Some(entity), None);
    }
    Ok(removed)
  }

  async fn delete_all(&self, filter: &(dyn for<'e> Fn(&'e T) -> bool + Send + Sync)) -> Result<usize> {
    let mut state = self.lock()?;
    let ids: Vec<String> = state.entities
                                .values()
                                .filter(|e| filter(e))
                                .map(|e| e.id().to_string())
                                .collect();
    for id in &ids {
      if let Some(entity) = state.entities.shift_remove(id) {
        state.publish(EntityChangeType::Delete, Some(&entity), None);
      }
    }
    Ok(ids.len())
  }

  async fn subscribe(&self, filter: Box<dyn for<'e> Fn(&'e T) -> bool + Send + Sync>) -> Result<Box<dyn Subscription<T>>> {
    let mut state = self.lock()?;
    let initial = match state.entities.values().find(|e| filter(e)) {
      Some(entity) => EntityChange::new(EntityChangeType::Update, Some(entity.clone())),
      None => EntityChange::new(EntityChangeType::Delete, None),
    };
    let (sender, receiver) = watch::channel(initial);
    state.subscribers.push(Subscriber { filter, sender });
    Ok(Box::new(MemorySubscription { receiver }))
  }
}

/// Suscripción respaldada por un `watch::Receiver`: sólo conserva el
/// último cambio, que es lo que necesitan los que esperan sobre él.
pub struct MemorySubscription<T> {
  receiver: watch::Receiver<EntityChange<T>>,
}

#[async_trait]
impl<T: Entity> Subscription<T> for MemorySubscription<T> {
  fn change(&mut self) -> EntityChange<T> {
    self.receiver.borrow_and_update().clone()
  }

  async fn wait_for_change(&mut self, timeout: Option<Duration>) -> Result<bool> {
    let changed = self.receiver.changed();
    match timeout {
      None => changed.await.map(|_| true).map_err(|_| DataAccessError::SubscriptionClosed),
      Some(timeout) => match tokio::time::timeout(timeout, changed).await {
        Ok(Ok(())) => Ok(true),
        Ok(Err(_)) => Err(DataAccessError::SubscriptionClosed),
        Err(_) => Ok(false),
      },
    }
  }
}

/// Contexto transaccional sin efectos. Cuenta las transacciones para que
/// las pruebas puedan verificar qué caminos confirmaron o abortaron.
#[derive(Debug, Default)]
pub struct MemoryDataAccessContext {
  begun: AtomicUsize,
  committed: AtomicUsize,
  aborted: AtomicUsize,
}

impl MemoryDataAccessContext {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn begun(&self) -> usize {
    self.begun.load(Ordering::SeqCst)
  }

  pub fn committed(&self) -> usize {
    self.committed.load(Ordering::SeqCst)
  }

  pub fn aborted(&self) -> usize {
    self.aborted.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl DataAccessContext for MemoryDataAccessContext {
  async fn begin_transaction(&self) -> Result<()> {
    self.begun.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  async fn commit_transaction(&self) -> Result<()> {
    self.committed.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  async fn abort_transaction(&self) -> Result<()> {
    self.aborted.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}
