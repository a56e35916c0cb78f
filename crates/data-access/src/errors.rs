// Archivo: errors.rs
// Propósito: errores de la capa de acceso a datos y el alias Result<T>.
use thiserror::Error;

/// Errores comunes de los repositorios.
///
/// - `NotFound`: la entidad buscada no existe.
/// - `DuplicateKey`: inserción con un id ya presente.
/// - `Storage`: fallo del almacenamiento subyacente.
/// - `SubscriptionClosed`: el repositorio dejó de publicar cambios.
/// - `Other`: cualquier otro error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataAccessError {
  /// Entidad no encontrada.
  #[error("No encontrado: {0}")]
  NotFound(String),
  /// Clave duplicada en una inserción.
  #[error("Clave duplicada: {0}")]
  DuplicateKey(String),
  /// Error genérico de almacenamiento.
  #[error("Error de almacenamiento: {0}")]
  Storage(String),
  /// La suscripción perdió su origen de cambios.
  #[error("Suscripción cerrada")]
  SubscriptionClosed,
  /// Otro tipo de error.
  #[error("Otro: {0}")]
  Other(String),
}

/// Alias de resultado usado por las APIs del crate.
pub type Result<T> = std::result::Result<T, DataAccessError>;
