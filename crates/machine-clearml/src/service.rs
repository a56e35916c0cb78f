// Archivo: service.rs
// Propósito: contrato del servicio de cola remota de tareas de ML.
use crate::errors::Result;
use crate::task::ClearMlTask;
use async_trait::async_trait;

/// Operaciones de ClearML que usan el runner remoto y el bucle de
/// reconciliación.
#[async_trait]
pub trait ClearMlService: Send + Sync {
  /// Id del proyecto de un motor, o `None` si no existe.
  async fn get_project_id(&self, name: &str) -> Result<Option<String>>;

  async fn create_project(&self, name: &str, description: Option<&str>) -> Result<String>;

  async fn delete_project(&self, id: &str) -> Result<bool>;

  /// Crea una tarea de entrenamiento llamada como el build.
  async fn create_task(&self, build_id: &str, project_id: &str, script: &str, docker_image: &str) -> Result<String>;

  async fn delete_task(&self, id: &str) -> Result<bool>;

  async fn enqueue_task(&self, id: &str, queue: &str) -> Result<bool>;

  async fn dequeue_task(&self, id: &str) -> Result<bool>;

  /// Detiene la tarea a la fuerza.
  async fn stop_task(&self, id: &str) -> Result<bool>;

  /// Tareas presentes físicamente en la cola.
  async fn get_tasks_for_queue(&self, queue: &str) -> Result<Vec<ClearMlTask>>;

  async fn get_task_by_name(&self, name: &str) -> Result<Option<ClearMlTask>>;

  async fn get_tasks_by_id(&self, ids: &[String]) -> Result<Vec<ClearMlTask>>;
}
