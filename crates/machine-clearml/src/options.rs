use std::time::Duration;

/// Conexión y comportamiento del cliente ClearML.
#[derive(Debug, Clone)]
pub struct ClearMlOptions {
  pub api_server: String,
  pub access_key: String,
  pub secret_key: String,
  /// Los proyectos se crean como `{root_project}/{project}/{engine_id}`.
  pub root_project: String,
  pub project: String,
  pub docker_image: String,
  /// Entorno que recibe el contenedor (`ENV_FOR_DYNACONF`).
  pub environment: String,
  pub build_polling_enabled: bool,
  pub build_polling_timeout: Duration,
  pub token_refresh_interval: Duration,
  pub request_timeout: Duration,
}

impl Default for ClearMlOptions {
  fn default() -> Self {
    Self { api_server: "http://localhost:8008".into(),
           access_key: String::new(),
           secret_key: String::new(),
           root_project: "Machine".into(),
           project: "dev".into(),
           docker_image: String::new(),
           environment: "development".into(),
           build_polling_enabled: false,
           build_polling_timeout: Duration::from_secs(10),
           token_refresh_interval: Duration::from_secs(3600),
           request_timeout: Duration::from_secs(30) }
  }
}
