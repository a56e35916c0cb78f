// Archivo: shared_files.rs
// Propósito: almacén de ficheros compartido entre hosts y trabajadores
// remotos (corpus de builds y modelos), direccionado por rutas relativas.
use crate::errors::{MachineError, Result};
use async_trait::async_trait;
use data_access::DataAccessError;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[async_trait]
pub trait SharedFileService: Send + Sync {
  /// URI base que reciben los trabajadores remotos.
  fn base_uri(&self) -> &str;

  async fn write(&self, path: &str, content: Vec<u8>) -> Result<()>;

  async fn read(&self, path: &str) -> Result<Vec<u8>>;

  async fn exists(&self, path: &str) -> Result<bool>;

  /// Rutas bajo el prefijo, ordenadas.
  async fn list(&self, prefix: &str) -> Result<Vec<String>>;

  /// Elimina todo lo que cuelga del prefijo. Devuelve cuántos ficheros
  /// se borraron.
  async fn delete(&self, prefix: &str) -> Result<usize>;
}

/// Escribe líneas de texto separadas por `\n`.
pub async fn write_lines(files: &dyn SharedFileService, path: &str, lines: &[String]) -> Result<()> {
  let mut content = lines.join("\n");
  if !lines.is_empty() {
    content.push('\n');
  }
  files.write(path, content.into_bytes()).await
}

pub async fn read_lines(files: &dyn SharedFileService, path: &str) -> Result<Vec<String>> {
  let bytes = files.read(path).await?;
  let text = String::from_utf8(bytes).map_err(|e| MachineError::Validation(format!("{path} no es UTF-8: {e}")))?;
  Ok(text.lines().map(str::to_string).collect())
}

pub struct MemorySharedFileService {
  base_uri: String,
  files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemorySharedFileService {
  pub fn new() -> Self {
    Self::with_base_uri("memory://machine/")
  }

  pub fn with_base_uri(base_uri: &str) -> Self {
    Self { base_uri: base_uri.to_string(),
           files: Mutex::new(BTreeMap::new()) }
  }

  fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
    self.files
        .lock()
        .map_err(|e| DataAccessError::Storage(format!("almacén de ficheros envenenado: {e}")).into())
  }
}

impl Default for MemorySharedFileService {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl SharedFileService for MemorySharedFileService {
  fn base_uri(&self) -> &str {
    &self.base_uri
  }

  async fn write(&self, path: &str, content: Vec<u8>) -> Result<()> {
    self.lock()?.insert(path.to_string(), content);
    Ok(())
  }

  async fn read(&self, path: &str) -> Result<Vec<u8>> {
    self.lock()?
        .get(path)
        .cloned()
        .ok_or_else(|| DataAccessError::NotFound(path.to_string()).into())
  }

  async fn exists(&self, path: &str) -> Result<bool> {
    Ok(self.lock()?.contains_key(path))
  }

  async fn list(&self, prefix: &str) -> Result<Vec<String>> {
    Ok(self.lock()?.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
  }

  async fn delete(&self, prefix: &str) -> Result<usize> {
    let mut files = self.lock()?;
    let before = files.len();
    files.retain(|k, _| !k.starts_with(prefix));
    Ok(before - files.len())
  }
}
