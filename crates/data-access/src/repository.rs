// Archivo: repository.rs
// Propósito: contrato genérico de repositorio con actualizaciones
// condicionales atómicas y suscripciones a cambios, más el contexto de
// transacciones que usan los servicios de alto nivel.
use crate::entity::{Entity, EntityChange};
use crate::errors::Result;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Qué versión de la entidad devuelve `update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Returning {
  Original,
  Updated,
}

/// Repositorio de entidades.
///
/// Toda mutación evalúa su filtro en el mismo instante en que modifica la
/// entidad: un filtro que no coincide no produce efectos. Este es el único
/// mecanismo de concurrencia que necesitan los llamadores (nunca leer y
/// luego escribir).
#[async_trait]
pub trait Repository<T: Entity>: Send + Sync {
  /// Primera entidad que satisface el filtro.
  async fn get(&self, filter: &(dyn for<'e> Fn(&'e T) -> bool + Send + Sync)) -> Result<Option<T>>;

  async fn get_by_id(&self, id: &str) -> Result<Option<T>> {
    self.get(&|e: &T| e.id() == id).await
  }

  async fn get_all(&self, filter: &(dyn for<'e> Fn(&'e T) -> bool + Send + Sync)) -> Result<Vec<T>>;

  async fn exists(&self, filter: &(dyn for<'e> Fn(&'e T) -> bool + Send + Sync)) -> Result<bool> {
    Ok(self.get(filter).await?.is_some())
  }

  /// Inserta la entidad. Falla con `DuplicateKey` si el id ya existe.
  async fn insert(&self, entity: T) -> Result<T>;

  /// Aplica `update` a la primera entidad que satisface `filter` y devuelve
  /// la versión pedida, o `None` si ninguna coincidía.
  async fn update(&self,
                  filter: &(dyn for<'e> Fn(&'e T) -> bool + Send + Sync),
                  update: &(dyn for<'e> Fn(&'e mut T) + Send + Sync),
                  returning: Returning)
                  -> Result<Option<T>>;

  /// Aplica `update` a todas las entidades que satisfacen `filter`.
  /// Devuelve cuántas se modificaron.
  async fn update_all(&self,
                      filter: &(dyn for<'e> Fn(&'e T) -> bool + Send + Sync),
                      update: &(dyn for<'e> Fn(&'e mut T) + Send + Sync))
                      -> Result<usize>;

  /// Elimina la primera entidad que satisface el filtro y la devuelve.
  async fn delete(&self, filter: &(dyn for<'e> Fn(&'e T) -> bool + Send + Sync)) -> Result<Option<T>>;

  async fn delete_all(&self, filter: &(dyn for<'e> Fn(&'e T) -> bool + Send + Sync)) -> Result<usize>;

  /// Se suscribe a los cambios de la entidad que satisface `filter`.
  async fn subscribe(&self, filter: Box<dyn for<'e> Fn(&'e T) -> bool + Send + Sync>) -> Result<Box<dyn Subscription<T>>>;
}

/// Suscripción a los cambios de una entidad.
///
/// `change` devuelve el último cambio conocido y lo marca como visto;
/// `wait_for_change` se resuelve con `true` cuando llega uno nuevo (incluido
/// uno publicado entre la última lectura y la espera) o `false` al vencer
/// el timeout.
#[async_trait]
pub trait Subscription<T: Entity>: Send {
  fn change(&mut self) -> EntityChange<T>;

  async fn wait_for_change(&mut self, timeout: Option<Duration>) -> Result<bool>;
}

/// Contexto transaccional del almacenamiento.
#[async_trait]
pub trait DataAccessContext: Send + Sync {
  async fn begin_transaction(&self) -> Result<()>;
  async fn commit_transaction(&self) -> Result<()>;
  async fn abort_transaction(&self) -> Result<()>;
}

/// Ejecuta `f` dentro de una transacción: confirma si devuelve `Ok` y
/// aborta si devuelve `Err`. El error de `f` tiene prioridad sobre un
/// fallo al abortar, que sólo se registra.
pub async fn with_transaction<F, Fut, R, E>(context: &dyn DataAccessContext, f: F) -> std::result::Result<R, E>
  where F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<R, E>>,
        E: From<crate::errors::DataAccessError>
{
  context.begin_transaction().await?;
  match f().await {
    Ok(value) => {
      context.commit_transaction().await?;
      Ok(value)
    }
    Err(e) => {
      if let Err(abort) = context.abort_transaction().await {
        log::warn!("no se pudo abortar la transacción: {}", abort);
      }
      Err(e)
    }
  }
}
