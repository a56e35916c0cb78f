// Archivo: engine_state/model.rs
// Propósito: contrato de los modelos de traducción por familia de motor y
// una implementación "echo" que guarda pares entrenados.
use crate::errors::{MachineError, Result};
use dashmap::DashMap;
use machine_domain::ProgressStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Modelo cargado en memoria. Las llamadas no son interrumpibles.
pub trait TranslationModel: Send + Sync {
  fn translate(&self, segment: &str) -> Result<String>;

  fn train_segment(&mut self, source: &str, target: &str) -> Result<()>;

  /// Persiste los cambios incrementales en el directorio del motor.
  fn save(&mut self) -> Result<()>;
}

/// Resultado de un entrenamiento completo.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainedModel {
  /// Modelo empaquetado, listo para `install`.
  pub artifact: Vec<u8>,
  pub train_corpus_size: i32,
  pub confidence: f64,
}

/// Crea, entrena e instala modelos de una familia de motores.
pub trait ModelFactory: Send + Sync {
  fn init_new(&self, engine_dir: &Path) -> Result<()>;

  fn create(&self, engine_dir: &Path) -> Result<Box<dyn TranslationModel>>;

  fn train(&self, source: &[String], target: &[String], progress: &dyn Fn(ProgressStatus)) -> Result<TrainedModel>;

  /// Reemplaza el modelo del directorio por el artefacto entrenado.
  fn install(&self, engine_dir: &Path, artifact: &[u8]) -> Result<()>;

  fn cleanup(&self, engine_dir: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct EchoModelData {
  pairs: BTreeMap<String, String>,
}

/// Devuelve la traducción entrenada si la conoce y el propio segmento si
/// no. El "disco" es un mapa compartido por directorio.
#[derive(Clone, Default)]
pub struct EchoModelFactory {
  store: Arc<DashMap<PathBuf, EchoModelData>>,
}

impl EchoModelFactory {
  pub fn new() -> Self {
    Self::default()
  }

  /// Pares persistidos en el directorio, si existe.
  pub fn saved_pairs(&self, engine_dir: &Path) -> Option<BTreeMap<String, String>> {
    self.store.get(engine_dir).map(|d| d.pairs.clone())
  }

  pub fn exists(&self, engine_dir: &Path) -> bool {
    self.store.contains_key(engine_dir)
  }
}

impl ModelFactory for EchoModelFactory {
  fn init_new(&self, engine_dir: &Path) -> Result<()> {
    self.store.insert(engine_dir.to_path_buf(), EchoModelData::default());
    Ok(())
  }

  fn create(&self, engine_dir: &Path) -> Result<Box<dyn TranslationModel>> {
    let data = self.store
                   .get(engine_dir)
                   .map(|d| d.clone())
                   .ok_or_else(|| MachineError::Model(format!("no hay modelo en {}", engine_dir.display())))?;
    Ok(Box::new(EchoModel { engine_dir: engine_dir.to_path_buf(),
                            store: self.store.clone(),
                            data }))
  }

  fn train(&self, source: &[String], target: &[String], progress: &dyn Fn(ProgressStatus)) -> Result<TrainedModel> {
    if source.len() != target.len() {
      return Err(MachineError::Model(format!("corpus desalineado: {} fuentes, {} destinos",
                                             source.len(),
                                             target.len())));
    }
    let total = source.len().max(1) as f64;
    let mut data = EchoModelData::default();
    for (i, (s, t)) in source.iter().zip(target).enumerate() {
      data.pairs.insert(s.clone(), t.clone());
      progress(ProgressStatus::new(i as i32 + 1, Some((i + 1) as f64 / total), None));
    }
    Ok(TrainedModel { artifact: serde_json::to_vec(&data)?,
                      train_corpus_size: source.len() as i32,
                      confidence: if source.is_empty() { 0.0 } else { 100.0 } })
  }

  fn install(&self, engine_dir: &Path, artifact: &[u8]) -> Result<()> {
    let data: EchoModelData = serde_json::from_slice(artifact)?;
    self.store.insert(engine_dir.to_path_buf(), data);
    Ok(())
  }

  fn cleanup(&self, engine_dir: &Path) -> Result<()> {
    self.store.remove(engine_dir);
    Ok(())
  }
}

struct EchoModel {
  engine_dir: PathBuf,
  store: Arc<DashMap<PathBuf, EchoModelData>>,
  data: EchoModelData,
}

impl TranslationModel for EchoModel {
  fn translate(&self, segment: &str) -> Result<String> {
    Ok(self.data.pairs.get(segment).cloned().unwrap_or_else(|| segment.to_string()))
  }

  fn train_segment(&mut self, source: &str, target: &str) -> Result<()> {
    self.data.pairs.insert(source.to_string(), target.to_string());
    Ok(())
  }

  fn save(&mut self) -> Result<()> {
    self.store.insert(self.engine_dir.clone(), self.data.clone());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn echo_model_translates_trained_pairs() {
    let factory = EchoModelFactory::new();
    let dir = Path::new("engines/e1");
    factory.init_new(dir).unwrap();

    let trained = factory.train(&["hola".into()], &["hello".into()], &|_| {}).unwrap();
    assert_eq!(trained.train_corpus_size, 1);
    factory.install(dir, &trained.artifact).unwrap();

    let mut model = factory.create(dir).unwrap();
    assert_eq!(model.translate("hola").unwrap(), "hello");
    assert_eq!(model.translate("adiós").unwrap(), "adiós");

    model.train_segment("adiós", "bye").unwrap();
    assert!(!factory.saved_pairs(dir).unwrap().contains_key("adiós"));
    model.save().unwrap();
    assert_eq!(factory.saved_pairs(dir).unwrap()["adiós"], "bye");
  }
}
