// Archivo: http.rs
// Propósito: implementación HTTP de `ClearMlService`. Cada llamada es un
// POST a `{api_server}/{servicio}.{acción}` con cuerpo JSON y token bearer.
use crate::auth::ClearMlAuthService;
use crate::errors::{ClearMlError, Result};
use crate::options::ClearMlOptions;
use crate::service::ClearMlService;
use crate::task::ClearMlTask;
use async_trait::async_trait;
use log::warn;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const TASK_FIELDS: [&str; 14] = ["id",
                                 "name",
                                 "status",
                                 "project",
                                 "last_iteration",
                                 "status_reason",
                                 "status_message",
                                 "created",
                                 "started",
                                 "completed",
                                 "active_duration",
                                 "last_metrics",
                                 "hyperparams",
                                 "runtime"];

pub struct HttpClearMlService {
  client: reqwest::Client,
  options: ClearMlOptions,
  auth: Arc<dyn ClearMlAuthService>,
  /// Nombre de cola -> id. Se carga perezosamente y se refresca una vez
  /// cuando falta una cola.
  queue_ids: Mutex<Option<HashMap<String, String>>>,
}

impl HttpClearMlService {
  pub fn new(client: reqwest::Client, options: ClearMlOptions, auth: Arc<dyn ClearMlAuthService>) -> Self {
    Self { client,
           options,
           auth,
           queue_ids: Mutex::new(None) }
  }

  /// Construye el cliente HTTP con el timeout configurado.
  pub fn build_client(options: &ClearMlOptions) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(options.request_timeout).build()?)
  }

  fn project_path(&self, name: &str) -> String {
    format!("{}/{}/{}", self.options.root_project, self.options.project, name)
  }

  async fn call(&self, service: &str, action: &str, body: JsonValue) -> Result<JsonValue> {
    let path = format!("{}.{}", service, action);
    let url = format!("{}/{}", self.options.api_server.trim_end_matches('/'), path);
    let token = self.auth.auth_token().await?;
    let response = self.client.post(&url).bearer_auth(token).json(&body).send().await?;
    let status = response.status();
    let text = response.text().await?;
    match serde_json::from_str::<JsonValue>(&text) {
      Ok(value) if value.is_object() => Ok(value),
      _ if !status.is_success() => Err(ClearMlError::Status { status: status.as_u16(),
                                                              path }),
      _ => {
        warn!("no se pudo interpretar la respuesta {} de `{}`", status.as_u16(), path);
        Err(ClearMlError::MalformedResponse(path))
      }
    }
  }

  async fn get_tasks(&self, mut body: JsonValue) -> Result<Vec<ClearMlTask>> {
    body["only_fields"] = json!(TASK_FIELDS);
    let result = self.call("tasks", "get_all_ex", body).await?;
    match result.pointer("/data/tasks") {
      Some(tasks) => Ok(serde_json::from_value(tasks.clone())?),
      None => Ok(Vec::new()),
    }
  }

  async fn queue_names_to_ids(&self, refresh: bool) -> Result<HashMap<String, String>> {
    let mut cached = self.queue_ids.lock().await;
    if let (false, Some(ids)) = (refresh, cached.as_ref()) {
      return Ok(ids.clone());
    }
    let result = self.call("queues", "get_all", json!({})).await?;
    let queues = data(&result, "/data/queues")?.as_array()
                                               .ok_or_else(|| ClearMlError::MalformedResponse("queues.get_all".into()))?;
    let ids: HashMap<String, String> =
      queues.iter()
            .filter_map(|q| Some((q.get("name")?.as_str()?.to_string(), q.get("id")?.as_str()?.to_string())))
            .collect();
    *cached = Some(ids.clone());
    Ok(ids)
  }

  async fn queue_id(&self, queue: &str) -> Result<String> {
    if let Some(id) = self.queue_names_to_ids(false).await?.get(queue) {
      return Ok(id.clone());
    }
    self.queue_names_to_ids(true)
        .await?
        .get(queue)
        .cloned()
        .ok_or_else(|| ClearMlError::QueueNotFound(queue.to_string()))
  }
}

fn data<'a>(result: &'a JsonValue, pointer: &str) -> Result<&'a JsonValue> {
  result.pointer(pointer)
        .ok_or_else(|| ClearMlError::MalformedResponse(pointer.to_string()))
}

fn data_i64(result: &JsonValue, pointer: &str) -> Result<i64> {
  data(result, pointer)?.as_i64()
                        .ok_or_else(|| ClearMlError::MalformedResponse(pointer.to_string()))
}

fn data_str(result: &JsonValue, pointer: &str) -> Result<String> {
  data(result, pointer)?.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| ClearMlError::MalformedResponse(pointer.to_string()))
}

#[async_trait]
impl ClearMlService for HttpClearMlService {
  async fn get_project_id(&self, name: &str) -> Result<Option<String>> {
    let body = json!({ "name": self.project_path(name), "only_fields": ["id"] });
    let result = self.call("projects", "get_all", body).await?;
    let projects = data(&result, "/data/projects")?.as_array()
                                                   .ok_or_else(|| ClearMlError::MalformedResponse("projects".into()))?;
    Ok(projects.first()
               .and_then(|p| p.get("id"))
               .and_then(|id| id.as_str())
               .map(str::to_string))
  }

  async fn create_project(&self, name: &str, description: Option<&str>) -> Result<String> {
    let mut body = json!({ "name": self.project_path(name) });
    if let Some(description) = description {
      body["description"] = json!(description);
    }
    let result = self.call("projects", "create", body).await?;
    data_str(&result, "/data/id")
  }

  async fn delete_project(&self, id: &str) -> Result<bool> {
    // force: el proyecto puede tener tareas
    let body = json!({ "project": id, "delete_contents": true, "force": true });
    let result = self.call("projects", "delete", body).await?;
    Ok(data_i64(&result, "/data/deleted")? == 1)
  }

  async fn create_task(&self, build_id: &str, project_id: &str, script: &str, docker_image: &str) -> Result<String> {
    let body = json!({
      "name": build_id,
      "project": project_id,
      "script": { "diff": script },
      "container": {
        "image": docker_image,
        "arguments": format!("--env ENV_FOR_DYNACONF={}", self.options.environment),
      },
      "type": "training",
    });
    let result = self.call("tasks", "create", body).await?;
    data_str(&result, "/data/id")
  }

  async fn delete_task(&self, id: &str) -> Result<bool> {
    let result = self.call("tasks", "delete", json!({ "task": id })).await?;
    data(&result, "/data/deleted")?.as_bool()
                                   .ok_or_else(|| ClearMlError::MalformedResponse("/data/deleted".into()))
  }

  async fn enqueue_task(&self, id: &str, queue: &str) -> Result<bool> {
    let result = self.call("tasks", "enqueue", json!({ "task": id, "queue_name": queue })).await?;
    Ok(data_i64(&result, "/data/queued")? == 1)
  }

  async fn dequeue_task(&self, id: &str) -> Result<bool> {
    let result = self.call("tasks", "dequeue", json!({ "task": id })).await?;
    Ok(data_i64(&result, "/data/dequeued")? == 1)
  }

  async fn stop_task(&self, id: &str) -> Result<bool> {
    let result = self.call("tasks", "stop", json!({ "task": id, "force": true })).await?;
    Ok(data_i64(&result, "/data/updated")? == 1)
  }

  async fn get_tasks_for_queue(&self, queue: &str) -> Result<Vec<ClearMlTask>> {
    let queue_id = self.queue_id(queue).await?;
    let result = self.call("queues", "get_by_id", json!({ "queue": queue_id })).await?;
    let task_ids: Vec<String> = result.pointer("/data/queue/entries")
                                      .and_then(|e| e.as_array())
                                      .map(|entries| {
                                        entries.iter()
                                               .filter_map(|e| e.get("task")?.as_str().map(str::to_string))
                                               .collect()
                                      })
                                      .unwrap_or_default();
    self.get_tasks_by_id(&task_ids).await
  }

  async fn get_task_by_name(&self, name: &str) -> Result<Option<ClearMlTask>> {
    Ok(self.get_tasks(json!({ "name": name })).await?.into_iter().next())
  }

  async fn get_tasks_by_id(&self, ids: &[String]) -> Result<Vec<ClearMlTask>> {
    if ids.is_empty() {
      return Ok(Vec::new());
    }
    self.get_tasks(json!({ "id": ids })).await
  }
}
