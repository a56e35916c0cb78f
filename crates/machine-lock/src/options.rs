use std::time::Duration;

/// Tiempos por defecto del lock distribuido.
#[derive(Debug, Clone)]
pub struct LockOptions {
  /// Vida de un lease cuando el llamador no indica otra.
  pub default_lifetime: Duration,
  /// Tiempo máximo de espera para adquirir.
  pub acquire_timeout: Duration,
}

impl Default for LockOptions {
  fn default() -> Self {
    Self { default_lifetime: Duration::from_secs(56),
           acquire_timeout: Duration::from_secs(40) }
  }
}
