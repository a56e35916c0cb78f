// Archivo: entity.rs
// Propósito: contrato mínimo de las entidades persistidas y el tipo de
// cambio publicado a los suscriptores.
use serde::{Deserialize, Serialize};

/// Entidad identificada por un id string y versionada por `revision`.
///
/// El repositorio fija `revision = 1` al insertar y la incrementa en cada
/// actualización; los llamadores no deben tocarla.
pub trait Entity: Clone + Send + Sync + 'static {
  fn id(&self) -> &str;
  fn revision(&self) -> i64;
  fn set_revision(&mut self, revision: i64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityChangeType {
  Insert,
  Update,
  Delete,
}

/// Cambio observado por una suscripción. `entity` es `None` cuando la
/// entidad ya no existe.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityChange<T> {
  pub change_type: EntityChangeType,
  pub entity: Option<T>,
}

impl<T> EntityChange<T> {
  pub fn new(change_type: EntityChangeType, entity: Option<T>) -> Self {
    Self { change_type,
           entity }
  }
}
