use thiserror::Error;

// Errores del motor de builds.
//
// Centraliza los fallos de la capa de jobs: errores de acceso a datos, del
// lock distribuido y de la cola remota se envuelven con `#[from]`; el resto
// son condiciones de negocio que los llamadores distinguen por variante.
#[derive(Error, Debug)]
pub enum MachineError {
  /// El lock del motor no se obtuvo a tiempo.
  #[error("Tiempo de espera agotado esperando el lock de {0}")]
  LockTimeout(String),

  #[error("El motor {0} no existe")]
  EngineNotFound(String),

  /// Inferencia pedida antes del primer build exitoso.
  #[error("El motor {0} debe construirse primero")]
  EngineNotBuilt(String),

  #[error("El motor {0} ya está construyendo o cancelando")]
  AlreadyBuilding(String),

  #[error("El build del motor {0} ya se está cancelando")]
  AlreadyCanceling(String),

  #[error("El motor {0} no está construyendo")]
  NotBuilding(String),

  /// El motor se está eliminando y no admite más uso.
  #[error("El motor {0} se está eliminando")]
  EngineDeleting(String),

  /// Cancelación cooperativa observada en un límite de etapa.
  #[error("Operación cancelada")]
  Canceled,

  #[error("Build fallido: {0}")]
  Faulted(String),

  #[error("Error del modelo: {0}")]
  Model(String),

  #[error("Error de configuración: {0}")]
  Config(String),

  #[error("Error de validacion: {0}")]
  Validation(String),

  #[error("Error de acceso a datos: {0}")]
  DataAccess(#[from] data_access::DataAccessError),

  #[error("Error de lock: {0}")]
  Lock(machine_lock::LockError),

  #[error("Error de ClearML: {0}")]
  ClearMl(#[from] machine_clearml::ClearMlError),

  #[error("Error de dominio: {0}")]
  Domain(#[from] machine_domain::DomainError),

  #[error("Error de serializacion: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl MachineError {
  pub fn is_canceled(&self) -> bool {
    matches!(self, MachineError::Canceled | MachineError::Lock(machine_lock::LockError::Canceled))
  }
}

// El timeout del lock tiene su propia variante en la taxonomía pública.
impl From<machine_lock::LockError> for MachineError {
  fn from(e: machine_lock::LockError) -> Self {
    match e {
      machine_lock::LockError::Timeout(id) => MachineError::LockTimeout(id),
      other => MachineError::Lock(other),
    }
  }
}

pub type Result<T> = std::result::Result<T, MachineError>;
