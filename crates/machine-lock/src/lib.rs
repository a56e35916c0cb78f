//! Crate `machine-lock`: lock lector/escritor distribuido por recurso
//!
//! El estado vive en un `LockDocument` por recurso (escritor, lectores y
//! cola FIFO de escritores) y sólo se modifica con actualizaciones
//! condicionales del repositorio. La vida de cada lease está acotada por
//! `expires_at`, de modo que un proceso caído nunca bloquea para siempre.
pub mod errors;
pub mod factory;
pub mod lock;
pub mod options;

pub use errors::{LockError, Result};
pub use factory::LockFactory;
pub use lock::{DistributedReaderWriterLock, LockGuard, LockKind};
pub use options::LockOptions;
