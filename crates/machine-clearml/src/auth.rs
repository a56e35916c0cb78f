// Archivo: auth.rs
// Propósito: obtención y cacheo del token bearer de ClearML.
use crate::errors::{ClearMlError, Result};
use crate::options::ClearMlOptions;
use async_trait::async_trait;
use log::debug;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[async_trait]
pub trait ClearMlAuthService: Send + Sync {
  async fn auth_token(&self) -> Result<String>;
}

/// Pide el token a `auth.login` con las credenciales del servidor y lo
/// reutiliza hasta `token_refresh_interval`.
pub struct HttpClearMlAuthService {
  client: reqwest::Client,
  options: ClearMlOptions,
  token: Mutex<Option<(String, Instant)>>,
}

impl HttpClearMlAuthService {
  pub fn new(client: reqwest::Client, options: ClearMlOptions) -> Self {
    Self { client,
           options,
           token: Mutex::new(None) }
  }

  async fn login(&self) -> Result<String> {
    let url = format!("{}/auth.login", self.options.api_server.trim_end_matches('/'));
    let response = self.client
                       .post(&url)
                       .basic_auth(&self.options.access_key, Some(&self.options.secret_key))
                       .send()
                       .await?;
    let status = response.status();
    if !status.is_success() {
      return Err(ClearMlError::Auth(format!("auth.login respondió {}", status.as_u16())));
    }
    let body: JsonValue = response.json().await?;
    body.pointer("/data/token")
        .and_then(|t| t.as_str())
        .map(str::to_string)
        .ok_or_else(|| ClearMlError::MalformedResponse("auth.login sin token".into()))
  }
}

#[async_trait]
impl ClearMlAuthService for HttpClearMlAuthService {
  async fn auth_token(&self) -> Result<String> {
    let mut cached = self.token.lock().await;
    if let Some((token, obtained)) = cached.as_ref() {
      if obtained.elapsed() < self.options.token_refresh_interval {
        return Ok(token.clone());
      }
    }
    debug!("renovando token de ClearML");
    let token = self.login().await?;
    *cached = Some((token.clone(), Instant::now()));
    Ok(token)
  }
}
