// Archivo: engine_state/state.rs
// Propósito: estado en memoria de un motor: modelo cargado de forma
// perezosa, revisión que representa, marca de cambios y último uso.
use super::model::{ModelFactory, TranslationModel};
use crate::errors::{MachineError, Result};
use log::debug;
use machine_domain::TrainSegmentPair;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};

/// Revisión de un estado sin modelo cargado.
pub const UNSET_REVISION: i64 = -1;

struct Loaded {
  model: Option<Box<dyn TranslationModel>>,
  current_build_revision: i64,
  last_used: Instant,
  is_updated: bool,
}

impl Loaded {
  fn save(&mut self) -> Result<()> {
    if let (Some(model), true) = (self.model.as_mut(), self.is_updated) {
      model.save()?;
      self.is_updated = false;
    }
    Ok(())
  }

  fn unload(&mut self) -> Result<()> {
    if self.model.is_none() {
      return Ok(());
    }
    self.save()?;
    self.model = None;
    self.current_build_revision = UNSET_REVISION;
    Ok(())
  }
}

/// Estado de un motor. Todas las operaciones sobre el modelo pasan por un
/// mutex local; la exclusión entre hosts la da el lock distribuido del
/// llamador.
pub struct EngineState {
  engine_id: String,
  engine_dir: PathBuf,
  factory: Arc<dyn ModelFactory>,
  inner: Mutex<Loaded>,
  marked_for_deletion: AtomicBool,
}

impl EngineState {
  pub fn new(engine_id: &str, engine_dir: PathBuf, factory: Arc<dyn ModelFactory>) -> Self {
    Self { engine_id: engine_id.to_string(),
           engine_dir,
           factory,
           inner: Mutex::new(Loaded { model: None,
                                      current_build_revision: UNSET_REVISION,
                                      last_used: Instant::now(),
                                      is_updated: false }),
           marked_for_deletion: AtomicBool::new(false) }
  }

  pub fn engine_id(&self) -> &str {
    &self.engine_id
  }

  pub fn engine_dir(&self) -> &Path {
    &self.engine_dir
  }

  pub fn factory(&self) -> &Arc<dyn ModelFactory> {
    &self.factory
  }

  pub async fn is_loaded(&self) -> bool {
    self.inner.lock().await.model.is_some()
  }

  pub async fn is_updated(&self) -> bool {
    self.inner.lock().await.is_updated
  }

  pub async fn current_build_revision(&self) -> i64 {
    self.inner.lock().await.current_build_revision
  }

  pub fn is_marked_for_deletion(&self) -> bool {
    self.marked_for_deletion.load(Ordering::SeqCst)
  }

  pub fn mark_for_deletion(&self) {
    self.marked_for_deletion.store(true, Ordering::SeqCst);
  }

  fn ensure_usable(&self) -> Result<()> {
    if self.is_marked_for_deletion() {
      return Err(MachineError::EngineDeleting(self.engine_id.clone()));
    }
    Ok(())
  }

  pub fn init_new(&self) -> Result<()> {
    self.factory.init_new(&self.engine_dir)
  }

  /// Garantiza que el modelo cargado corresponde a `build_revision`. Un
  /// modelo de otra revisión se descarta sin guardar sus cambios.
  async fn load(&self, build_revision: i64) -> Result<MutexGuard<'_, Loaded>> {
    let mut inner = self.inner.lock().await;
    if inner.model.is_some()
       && inner.current_build_revision != UNSET_REVISION
       && inner.current_build_revision != build_revision
    {
      debug!("motor {}: revisión {} → {}, descargando", self.engine_id, inner.current_build_revision, build_revision);
      inner.is_updated = false;
      inner.unload()?;
    }
    if inner.model.is_none() {
      inner.model = Some(self.factory.create(&self.engine_dir)?);
    }
    inner.current_build_revision = build_revision;
    Ok(inner)
  }

  /// Ejecuta `f` sobre el modelo de la revisión pedida.
  pub async fn with_model<R>(&self, build_revision: i64, f: impl FnOnce(&dyn TranslationModel) -> Result<R>) -> Result<R> {
    self.ensure_usable()?;
    let inner = self.load(build_revision).await?;
    let model = inner.model
                     .as_deref()
                     .ok_or_else(|| MachineError::Model(format!("motor {} sin modelo", self.engine_id)))?;
    f(model)
  }

  pub async fn translate(&self, build_revision: i64, segment: &str) -> Result<String> {
    self.with_model(build_revision, |m| m.translate(segment)).await
  }

  /// Entrena un par y marca el modelo como modificado.
  pub async fn train_segment(&self, build_revision: i64, source: &str, target: &str) -> Result<()> {
    self.ensure_usable()?;
    let mut inner = self.load(build_revision).await?;
    let model = inner.model
                     .as_mut()
                     .ok_or_else(|| MachineError::Model(format!("motor {} sin modelo", self.engine_id)))?;
    model.train_segment(source, target)?;
    inner.is_updated = true;
    Ok(())
  }

  pub async fn touch(&self) {
    self.inner.lock().await.last_used = Instant::now();
  }

  /// Commit periódico: descarga si la revisión avanzó o si lleva inactivo
  /// más de `inactive_timeout`; si no, guarda los cambios pendientes.
  pub async fn commit(&self, build_revision: i64, inactive_timeout: Duration) -> Result<()> {
    let mut inner = self.inner.lock().await;
    if inner.model.is_none() {
      return Ok(());
    }
    if inner.current_build_revision == UNSET_REVISION {
      inner.current_build_revision = build_revision;
    }
    if build_revision != inner.current_build_revision {
      inner.unload()?;
      inner.current_build_revision = build_revision;
    } else if inner.last_used.elapsed() > inactive_timeout {
      debug!("motor {} inactivo, descargando", self.engine_id);
      inner.unload()?;
    } else {
      inner.save()?;
    }
    Ok(())
  }

  /// Descarga guardando los cambios pendientes.
  pub async fn unload(&self) -> Result<()> {
    self.inner.lock().await.unload()
  }

  /// Instala el modelo de un build nuevo descartando los cambios del
  /// anterior y vuelve a entrenar sobre él los pares recogidos mientras se
  /// construía. El modelo queda descargado.
  pub async fn install(&self, artifact: &[u8], pairs: &[TrainSegmentPair]) -> Result<()> {
    let mut inner = self.inner.lock().await;
    inner.is_updated = false;
    inner.unload()?;
    self.factory.install(&self.engine_dir, artifact)?;
    if pairs.is_empty() {
      return Ok(());
    }
    let mut model = self.factory.create(&self.engine_dir)?;
    for pair in pairs {
      model.train_segment(&pair.source, &pair.target)?;
    }
    model.save()?;
    debug!("motor {}: {} pares reentrenados sobre el modelo nuevo", self.engine_id, pairs.len());
    Ok(())
  }

  pub async fn delete_data(&self) -> Result<()> {
    self.unload().await?;
    self.factory.cleanup(&self.engine_dir)
  }
}
