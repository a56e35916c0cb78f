// Archivo: errors.rs
// Propósito: errores del cliente de la cola remota de tareas.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClearMlError {
  #[error("Error HTTP: {0}")]
  Http(#[from] reqwest::Error),
  #[error("El servidor respondió {status} en {path}")]
  Status { status: u16, path: String },
  #[error("Respuesta malformada del servidor ClearML: {0}")]
  MalformedResponse(String),
  #[error("La cola {0} no existe")]
  QueueNotFound(String),
  #[error("Error de autenticación: {0}")]
  Auth(String),
  #[error("Error de serialización: {0}")]
  Json(#[from] serde_json::Error),
  #[error("Otro: {0}")]
  Other(String),
}

pub type Result<T> = std::result::Result<T, ClearMlError>;
