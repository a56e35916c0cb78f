//! Crate `machine-clearml`: cliente de la cola remota de tareas de ML
//!
//! Expone el contrato `ClearMlService`, su implementación HTTP con token
//! bearer (`HttpClearMlService` + `HttpClearMlAuthService`), el modelo de
//! tarea (`ClearMlTask`) y un servicio en memoria para pruebas.
pub mod auth;
pub mod errors;
pub mod http;
pub mod metrics;
pub mod options;
pub mod service;
pub mod stubs;
pub mod task;

pub use auth::{ClearMlAuthService, HttpClearMlAuthService};
pub use errors::{ClearMlError, Result};
pub use http::HttpClearMlService;
pub use metrics::{metric_key, CONFIDENCE_VARIANT, SUMMARY_METRIC, TRAIN_CORPUS_SIZE_VARIANT};
pub use options::ClearMlOptions;
pub use service::ClearMlService;
pub use stubs::InMemoryClearMlService;
pub use task::{ClearMlHyperParameter, ClearMlMetricsEvent, ClearMlTask, ClearMlTaskStatus};
