// Archivo: errors.rs
// Propósito: errores del lock distribuido.
use data_access::DataAccessError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
  /// El lock no se obtuvo dentro del timeout. No se reintenta.
  #[error("Tiempo de espera agotado al adquirir el lock {0}")]
  Timeout(String),
  /// El lease venció mientras la sección crítica seguía en ejecución.
  #[error("El lease del lock {0} venció antes de terminar la operación")]
  Expired(String),
  #[error("Lock no encontrado: {0}")]
  NotFound(String),
  #[error("Duración de lease inválida")]
  InvalidLifetime,
  #[error("Adquisición cancelada")]
  Canceled,
  #[error("Error de acceso a datos: {0}")]
  DataAccess(#[from] DataAccessError),
}

pub type Result<T> = std::result::Result<T, LockError>;
