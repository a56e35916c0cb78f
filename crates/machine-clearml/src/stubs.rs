// Archivo: stubs.rs
// Propósito: servicio ClearML en memoria para pruebas y wiring rápido.
// Simula proyectos, tareas y colas; los helpers `set_status`/`update_task`
// permiten a las pruebas avanzar las tareas como lo haría un agente.
use crate::errors::{ClearMlError, Result};
use crate::service::ClearMlService;
use crate::task::{ClearMlTask, ClearMlTaskStatus};
use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct State {
  projects: HashMap<String, String>,
  tasks: IndexMap<String, ClearMlTask>,
  scripts: HashMap<String, String>,
  queues: HashMap<String, Vec<String>>,
  next_id: u64,
}

impl State {
  fn next_id(&mut self, prefix: &str) -> String {
    self.next_id += 1;
    format!("{}{}", prefix, self.next_id)
  }

  fn remove_from_queues(&mut self, task_id: &str) -> bool {
    let mut removed = false;
    for entries in self.queues.values_mut() {
      let before = entries.len();
      entries.retain(|t| t != task_id);
      removed |= entries.len() != before;
    }
    removed
  }
}

#[derive(Default)]
pub struct InMemoryClearMlService {
  state: Mutex<State>,
}

impl InMemoryClearMlService {
  pub fn new() -> Self {
    Self::default()
  }

  /// Helper para mapear `Mutex::lock()` en un `Result`.
  fn lock(&self) -> Result<MutexGuard<'_, State>> {
    self.state
        .lock()
        .map_err(|e| ClearMlError::Other(format!("mutex poisoned: {:?}", e)))
  }

  /// Declara una cola vacía.
  pub fn add_queue(&self, queue: &str) -> Result<()> {
    self.lock()?.queues.entry(queue.to_string()).or_default();
    Ok(())
  }

  pub fn task(&self, id: &str) -> Option<ClearMlTask> {
    self.lock().ok()?.tasks.get(id).cloned()
  }

  pub fn task_ids(&self) -> Vec<String> {
    self.lock().map(|s| s.tasks.keys().cloned().collect()).unwrap_or_default()
  }

  pub fn script(&self, task_id: &str) -> Option<String> {
    self.lock().ok()?.scripts.get(task_id).cloned()
  }

  pub fn queue_entries(&self, queue: &str) -> Vec<String> {
    self.lock()
        .ok()
        .and_then(|s| s.queues.get(queue).cloned())
        .unwrap_or_default()
  }

  /// Cambia el estado de una tarea; al dejar de esperar sale de su cola.
  pub fn set_status(&self, id: &str, status: ClearMlTaskStatus) -> Result<()> {
    self.update_task(id, |t| t.status = status)?;
    if !status.is_waiting() {
      self.lock()?.remove_from_queues(id);
    }
    Ok(())
  }

  pub fn update_task(&self, id: &str, update: impl FnOnce(&mut ClearMlTask)) -> Result<()> {
    let mut state = self.lock()?;
    let task = state.tasks
                    .get_mut(id)
                    .ok_or_else(|| ClearMlError::Other(format!("tarea {} inexistente", id)))?;
    update(task);
    Ok(())
  }

  /// Inserta una tarea tal cual, sin pasar por `create_task`.
  pub fn insert_task(&self, task: ClearMlTask, queue: Option<&str>) -> Result<()> {
    let mut state = self.lock()?;
    if let Some(queue) = queue {
      state.queues.entry(queue.to_string()).or_default().push(task.id.clone());
    }
    state.tasks.insert(task.id.clone(), task);
    Ok(())
  }
}

#[async_trait]
impl ClearMlService for InMemoryClearMlService {
  async fn get_project_id(&self, name: &str) -> Result<Option<String>> {
    Ok(self.lock()?.projects.get(name).cloned())
  }

  async fn create_project(&self, name: &str, _description: Option<&str>) -> Result<String> {
    let mut state = self.lock()?;
    let id = state.next_id("project");
    state.projects.insert(name.to_string(), id.clone());
    Ok(id)
  }

  async fn delete_project(&self, id: &str) -> Result<bool> {
    let mut state = self.lock()?;
    let before = state.projects.len();
    state.projects.retain(|_, p| p != id);
    let task_ids: Vec<String> = state.tasks
                                     .values()
                                     .filter(|t| t.project.as_deref() == Some(id))
                                     .map(|t| t.id.clone())
                                     .collect();
    for task_id in task_ids {
      state.tasks.shift_remove(&task_id);
      state.remove_from_queues(&task_id);
    }
    Ok(state.projects.len() != before)
  }

  async fn create_task(&self, build_id: &str, project_id: &str, script: &str, _docker_image: &str) -> Result<String> {
    let mut state = self.lock()?;
    let id = state.next_id("task");
    let mut task = ClearMlTask::new(&id, build_id, ClearMlTaskStatus::Created);
    task.project = Some(project_id.to_string());
    task.created = Some(Utc::now());
    state.tasks.insert(id.clone(), task);
    state.scripts.insert(id.clone(), script.to_string());
    Ok(id)
  }

  async fn delete_task(&self, id: &str) -> Result<bool> {
    let mut state = self.lock()?;
    state.remove_from_queues(id);
    Ok(state.tasks.shift_remove(id).is_some())
  }

  async fn enqueue_task(&self, id: &str, queue: &str) -> Result<bool> {
    let mut state = self.lock()?;
    if !state.queues.contains_key(queue) {
      return Err(ClearMlError::QueueNotFound(queue.to_string()));
    }
    let Some(task) = state.tasks.get_mut(id) else {
      return Ok(false);
    };
    task.status = ClearMlTaskStatus::Queued;
    state.queues.entry(queue.to_string()).or_default().push(id.to_string());
    Ok(true)
  }

  async fn dequeue_task(&self, id: &str) -> Result<bool> {
    let mut state = self.lock()?;
    if !state.remove_from_queues(id) {
      return Ok(false);
    }
    if let Some(task) = state.tasks.get_mut(id) {
      task.status = ClearMlTaskStatus::Created;
    }
    Ok(true)
  }

  async fn stop_task(&self, id: &str) -> Result<bool> {
    let mut state = self.lock()?;
    state.remove_from_queues(id);
    match state.tasks.get_mut(id) {
      Some(task) => {
        task.status = ClearMlTaskStatus::Stopped;
        Ok(true)
      }
      None => Ok(false),
    }
  }

  async fn get_tasks_for_queue(&self, queue: &str) -> Result<Vec<ClearMlTask>> {
    let state = self.lock()?;
    let entries = state.queues
                       .get(queue)
                       .ok_or_else(|| ClearMlError::QueueNotFound(queue.to_string()))?;
    Ok(entries.iter().filter_map(|id| state.tasks.get(id).cloned()).collect())
  }

  async fn get_task_by_name(&self, name: &str) -> Result<Option<ClearMlTask>> {
    Ok(self.lock()?.tasks.values().find(|t| t.name == name).cloned())
  }

  async fn get_tasks_by_id(&self, ids: &[String]) -> Result<Vec<ClearMlTask>> {
    let state = self.lock()?;
    Ok(ids.iter().filter_map(|id| state.tasks.get(id).cloned()).collect())
  }
}
