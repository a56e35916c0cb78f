//! Crate `data-access`: contrato de repositorio para entidades versionadas
//!
//! Define el trait `Repository<T>` con filtros evaluados atómicamente en el
//! momento de la mutación, suscripciones a cambios (`Subscription<T>`) para
//! esperar sin sondeo, y un contexto transaccional (`DataAccessContext`).
//! `stubs` trae una implementación en memoria para pruebas y demos.
//!
//! Ejemplo rápido:
//! ```rust
//! use data_access::MemoryRepository;
//! # #[derive(Clone)] struct Doc { id: String, revision: i64 }
//! # impl data_access::Entity for Doc {
//! #   fn id(&self) -> &str { &self.id }
//! #   fn revision(&self) -> i64 { self.revision }
//! #   fn set_revision(&mut self, r: i64) { self.revision = r }
//! # }
//! let repo: MemoryRepository<Doc> = MemoryRepository::new();
//! assert!(repo.is_empty());
//! ```
pub mod entity;
pub mod errors;
pub mod repository;
pub mod stubs;

pub use entity::*;
pub use errors::*;
pub use repository::*;
pub use stubs::*;
