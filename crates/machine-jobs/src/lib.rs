//! Crate `machine-jobs`: builds de motores de traducción
//!
//! Reúne la máquina de estados de los builds (`BuildJobService`), las dos
//! estrategias de ejecución (runner local en proceso y cola remota ClearML),
//! la plantilla de ciclo de vida de las etapas, el monitor que reconcilia
//! las tareas remotas, la caché de modelos por motor y la fachada
//! `TranslationEngineService`.
//!
//! Diseño resumido:
//! - `Engine::current_build` sólo cambia mediante actualizaciones
//!   condicionales; una cancelación y un arranque concurrentes nunca dejan
//!   dos builds vivos.
//! - Las transiciones del ciclo de vida se hacen bajo el lock de escritor
//!   del motor y dentro de una transacción junto con la notificación a la
//!   plataforma.
//! - La cancelación es cooperativa (`CancellationToken`) y se observa en
//!   los límites de etapa.
//!
//! Ejemplo rápido:
//! ```rust
//! use machine_jobs::config::MachineConfig;
//! let config = MachineConfig::default();
//! assert!(config.build_job.local_workers > 0);
//! ```
pub mod config;
pub mod engine_service;
pub mod engine_state;
pub mod errors;
pub mod job;
pub mod monitor;
pub mod platform;
pub mod recurrent;
pub mod runner;
pub mod service;
pub mod shared_files;

pub use config::{BuildJobOptions, EngineOptions, MachineConfig, ServiceOptions};
pub use engine_service::TranslationEngineService;
pub use errors::{MachineError, Result};
pub use monitor::ClearMlMonitorService;
pub use platform::{BuildStatus, MemoryOutbox, OutboxPlatformService, PlatformMessage, PlatformService};
pub use recurrent::{spawn_recurrent, RecurrentTask};
pub use service::BuildJobService;
pub use shared_files::{MemorySharedFileService, SharedFileService};
