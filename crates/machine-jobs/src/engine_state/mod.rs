//! Caché de modelos por motor: carga perezosa, seguimiento de revisión,
//! persistencia de cambios y descarga por inactividad.
mod model;
mod service;
mod state;

pub use model::{EchoModelFactory, ModelFactory, TrainedModel, TranslationModel};
pub use service::{EngineCommitService, EngineStateService};
pub use state::{EngineState, UNSET_REVISION};
