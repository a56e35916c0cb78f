// Archivo: config.rs
// Propósito: configuración del proceso leída de variables de entorno (con
// `.env` opcional vía dotenvy) y agrupada por área.
use crate::errors::{MachineError, Result};
use machine_clearml::ClearMlOptions;
use machine_domain::{BuildJobRunnerType, EngineType};
use machine_lock::LockOptions;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServiceOptions {
  /// Identificador de este host en los leases del lock.
  pub service_id: String,
}

#[derive(Debug, Clone)]
pub struct BuildJobOptions {
  /// Conserva `builds/{id}/` al terminar el postproceso.
  pub preserve_build_files: bool,
  pub local_workers: usize,
  /// Runner de la etapa Train por tipo de motor.
  pub train_runners: HashMap<EngineType, BuildJobRunnerType>,
  /// Cola remota por tipo de motor.
  pub clearml_queues: HashMap<EngineType, String>,
  pub model_type: String,
}

impl BuildJobOptions {
  pub fn train_runner(&self, engine_type: EngineType) -> BuildJobRunnerType {
    self.train_runners.get(&engine_type).copied().unwrap_or(BuildJobRunnerType::Local)
  }

  pub fn queue(&self, engine_type: EngineType) -> Option<&str> {
    self.clearml_queues.get(&engine_type).map(String::as_str)
  }
}

impl Default for BuildJobOptions {
  fn default() -> Self {
    let train_runners = EngineType::ALL.iter()
                                       .map(|t| {
                                         let runner = match t {
                                           EngineType::Nmt => BuildJobRunnerType::ClearMl,
                                           _ => BuildJobRunnerType::Local,
                                         };
                                         (*t, runner)
                                       })
                                       .collect();
    let clearml_queues = [(EngineType::Nmt, "production".to_string()),
                          (EngineType::SmtTransfer, "cpu_only".to_string()),
                          (EngineType::Echo, "cpu_only".to_string())].into_iter()
                                                                      .collect();
    Self { preserve_build_files: false,
           local_workers: 2,
           train_runners,
           clearml_queues,
           model_type: "huggingface".into() }
  }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
  pub engines_dir: PathBuf,
  pub engine_commit_frequency: Duration,
  pub inactive_engine_timeout: Duration,
  /// Vida del lease de escritor durante el commit de un motor.
  pub engine_commit_timeout: Duration,
  pub save_model_timeout: Duration,
}

impl Default for EngineOptions {
  fn default() -> Self {
    Self { engines_dir: PathBuf::from("engines"),
           engine_commit_frequency: Duration::from_secs(5 * 60),
           inactive_engine_timeout: Duration::from_secs(10 * 60),
           engine_commit_timeout: Duration::from_secs(60),
           save_model_timeout: Duration::from_secs(5 * 60) }
  }
}

#[derive(Debug, Clone)]
pub struct MachineConfig {
  pub service: ServiceOptions,
  pub lock: LockOptions,
  pub build_job: BuildJobOptions,
  pub clearml: ClearMlOptions,
  pub engine: EngineOptions,
}

impl Default for MachineConfig {
  fn default() -> Self {
    Self { service: ServiceOptions { service_id: "machine".into() },
           lock: LockOptions::default(),
           build_job: BuildJobOptions::default(),
           clearml: ClearMlOptions::default(),
           engine: EngineOptions::default() }
  }
}

impl MachineConfig {
  /// Carga `.env` si existe y lee el entorno del proceso.
  pub fn from_env() -> Result<Self> {
    dotenvy::dotenv().ok();
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  /// Construye la configuración a partir de una función de búsqueda de
  /// variables; las ausentes toman el valor por defecto.
  pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where F: Fn(&str) -> Option<String>
  {
    let env = Env { lookup: &lookup };
    let mut config = MachineConfig::default();

    if let Some(id) = env.string("MACHINE_SERVICE_ID") {
      config.service.service_id = id;
    }

    if let Some(v) = env.secs("MACHINE_LOCK_LIFETIME_SECS")? {
      config.lock.default_lifetime = v;
    }
    if let Some(v) = env.secs("MACHINE_LOCK_TIMEOUT_SECS")? {
      config.lock.acquire_timeout = v;
    }

    let build = &mut config.build_job;
    if let Some(v) = env.parse::<bool>("MACHINE_PRESERVE_BUILD_FILES")? {
      build.preserve_build_files = v;
    }
    if let Some(v) = env.parse::<usize>("MACHINE_LOCAL_WORKERS")? {
      if v == 0 {
        return Err(MachineError::Config("MACHINE_LOCAL_WORKERS debe ser mayor que 0".into()));
      }
      build.local_workers = v;
    }
    if let Some(v) = env.string("MACHINE_MODEL_TYPE") {
      build.model_type = v;
    }
    for engine_type in EngineType::ALL {
      let suffix = engine_type.as_str().to_ascii_uppercase();
      let key = format!("MACHINE_TRAIN_RUNNER_{suffix}");
      if let Some(raw) = env.string(&key) {
        let runner = BuildJobRunnerType::from_str(&raw).map_err(|e| MachineError::Config(format!("{key}: {e}")))?;
        build.train_runners.insert(engine_type, runner);
      }
      if let Some(queue) = env.string(&format!("MACHINE_CLEARML_QUEUE_{suffix}")) {
        build.clearml_queues.insert(engine_type, queue);
      }
    }

    let clearml = &mut config.clearml;
    if let Some(v) = env.string("CLEARML_API_SERVER") {
      clearml.api_server = v;
    }
    if let Some(v) = env.string("CLEARML_ACCESS_KEY") {
      clearml.access_key = v;
    }
    if let Some(v) = env.string("CLEARML_SECRET_KEY") {
      clearml.secret_key = v;
    }
    if let Some(v) = env.string("CLEARML_ROOT_PROJECT") {
      clearml.root_project = v;
    }
    if let Some(v) = env.string("CLEARML_PROJECT") {
      clearml.project = v;
    }
    if let Some(v) = env.string("CLEARML_DOCKER_IMAGE") {
      clearml.docker_image = v;
    }
    if let Some(v) = env.string("CLEARML_ENVIRONMENT") {
      clearml.environment = v;
    }
    if let Some(v) = env.parse::<bool>("CLEARML_BUILD_POLLING_ENABLED")? {
      clearml.build_polling_enabled = v;
    }
    if let Some(v) = env.secs("CLEARML_BUILD_POLLING_TIMEOUT_SECS")? {
      clearml.build_polling_timeout = v;
    }
    if let Some(v) = env.secs("CLEARML_TOKEN_REFRESH_SECS")? {
      clearml.token_refresh_interval = v;
    }

    let engine = &mut config.engine;
    if let Some(v) = env.string("MACHINE_ENGINES_DIR") {
      engine.engines_dir = PathBuf::from(v);
    }
    if let Some(v) = env.secs("MACHINE_ENGINE_COMMIT_FREQUENCY_SECS")? {
      engine.engine_commit_frequency = v;
    }
    if let Some(v) = env.secs("MACHINE_INACTIVE_ENGINE_TIMEOUT_SECS")? {
      engine.inactive_engine_timeout = v;
    }
    if let Some(v) = env.secs("MACHINE_ENGINE_COMMIT_TIMEOUT_SECS")? {
      engine.engine_commit_timeout = v;
    }
    if let Some(v) = env.secs("MACHINE_SAVE_MODEL_TIMEOUT_SECS")? {
      engine.save_model_timeout = v;
    }

    Ok(config)
  }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
  lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
  fn string(&self, key: &str) -> Option<String> {
    (self.lookup)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
  }

  fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
    match self.string(key) {
      None => Ok(None),
      Some(raw) => raw.parse::<T>()
                      .map(Some)
                      .map_err(|_| MachineError::Config(format!("{key}: valor inválido '{raw}'"))),
    }
  }

  fn secs(&self, key: &str) -> Result<Option<Duration>> {
    Ok(self.parse::<u64>(key)?.map(Duration::from_secs))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    move |key| map.get(key).cloned()
  }

  #[test]
  fn defaults_route_nmt_training_to_clearml() {
    let config = MachineConfig::from_lookup(lookup(&[])).unwrap();
    assert_eq!(config.build_job.train_runner(EngineType::Nmt), BuildJobRunnerType::ClearMl);
    assert_eq!(config.build_job.train_runner(EngineType::SmtTransfer), BuildJobRunnerType::Local);
    assert_eq!(config.build_job.queue(EngineType::Nmt), Some("production"));
    assert!(!config.clearml.build_polling_enabled);
  }

  #[test]
  fn reads_overrides() {
    let config = MachineConfig::from_lookup(lookup(&[("MACHINE_SERVICE_ID", "host-7"),
                                                     ("MACHINE_LOCK_TIMEOUT_SECS", "3"),
                                                     ("MACHINE_TRAIN_RUNNER_NMT", "local"),
                                                     ("MACHINE_CLEARML_QUEUE_ECHO", "gpu"),
                                                     ("CLEARML_BUILD_POLLING_ENABLED", "true"),
                                                     ("MACHINE_PRESERVE_BUILD_FILES", "true")])).unwrap();
    assert_eq!(config.service.service_id, "host-7");
    assert_eq!(config.lock.acquire_timeout, Duration::from_secs(3));
    assert_eq!(config.build_job.train_runner(EngineType::Nmt), BuildJobRunnerType::Local);
    assert_eq!(config.build_job.queue(EngineType::Echo), Some("gpu"));
    assert!(config.clearml.build_polling_enabled);
    assert!(config.build_job.preserve_build_files);
  }

  #[test]
  fn rejects_invalid_numbers() {
    let err = MachineConfig::from_lookup(lookup(&[("MACHINE_ENGINE_COMMIT_TIMEOUT_SECS", "soon")])).unwrap_err();
    assert!(matches!(err, MachineError::Config(_)));
    let err = MachineConfig::from_lookup(lookup(&[("MACHINE_LOCAL_WORKERS", "0")])).unwrap_err();
    assert!(matches!(err, MachineError::Config(_)));
  }
}
