// Archivo: runner/clearml.rs
// Propósito: runner sobre la cola remota de ClearML. Cada motor tiene su
// proyecto; cada build, una tarea llamada como el build.
use super::{BuildJobRunner, JobDefinition};
use crate::config::BuildJobOptions;
use crate::errors::{MachineError, Result};
use crate::shared_files::SharedFileService;
use async_trait::async_trait;
use data_access::Repository;
use log::{debug, info};
use machine_clearml::{ClearMlOptions, ClearMlService};
use machine_domain::{BuildJobRunnerType, BuildStage, Engine, EngineType};
use std::collections::HashMap;
use std::sync::Arc;

/// Genera el script Python que ejecuta la tarea remota.
#[async_trait]
pub trait ClearMlBuildJobFactory: Send + Sync {
  fn engine_type(&self) -> EngineType;

  async fn create_job_script(&self, job: &JobDefinition, model_type: &str) -> Result<String>;
}

/// Separa `esquema://servidor` de la carpeta de la URI base.
fn split_base_uri(uri: &str) -> (&str, &str) {
  let start = uri.find("://").map_or(0, |i| i + 3);
  match uri[start..].find('/') {
    Some(i) => (&uri[..start + i], &uri[start + i + 1..]),
    None => (uri, ""),
  }
}

fn train_script(module: &str,
                job: &JobDefinition,
                model_type: &str,
                base_uri: &str,
                extra_args: &[(&str, String)])
                -> String {
  let (server, folder) = split_base_uri(base_uri);
  let mut script = format!("from machine.jobs.{module} import run\nargs = {{\n");
  script.push_str(&format!("    'model_type': '{model_type}',\n"));
  script.push_str(&format!("    'engine_id': '{}',\n", job.engine_id));
  script.push_str(&format!("    'build_id': '{}',\n", job.build_id));
  for (name, value) in extra_args {
    script.push_str(&format!("    '{name}': '{value}',\n"));
  }
  script.push_str(&format!("    'shared_file_uri': '{server}',\n"));
  script.push_str(&format!("    'shared_file_folder': '{folder}',\n"));
  if let Some(options) = &job.options {
    script.push_str(&format!("    'build_options': '''{options}''',\n"));
  }
  script.push_str("    'clearml': True\n}\nrun(args)\n");
  script
}

pub struct NmtClearMlBuildJobFactory {
  engines: Arc<dyn Repository<Engine>>,
  shared_files: Arc<dyn SharedFileService>,
}

impl NmtClearMlBuildJobFactory {
  pub fn new(engines: Arc<dyn Repository<Engine>>, shared_files: Arc<dyn SharedFileService>) -> Self {
    Self { engines, shared_files }
  }
}

#[async_trait]
impl ClearMlBuildJobFactory for NmtClearMlBuildJobFactory {
  fn engine_type(&self) -> EngineType {
    EngineType::Nmt
  }

  async fn create_job_script(&self, job: &JobDefinition, model_type: &str) -> Result<String> {
    if job.stage != BuildStage::Train {
      return Err(MachineError::Validation(format!("etapa {:?} no soportada en ClearML", job.stage)));
    }
    let engine = self.engines
                     .get_by_id(&job.engine_id)
                     .await?
                     .ok_or_else(|| MachineError::EngineNotFound(job.engine_id.clone()))?;
    let mut args = vec![("src_lang", engine.source_language.clone()), ("trg_lang", engine.target_language.clone())];
    // El modelo se guarda con la revisión que tendrá el motor al terminar.
    if engine.is_model_persisted {
      args.push(("save_model", format!("{}_{}", engine.engine_id, engine.build_revision + 1)));
    }
    Ok(train_script("build_nmt_engine", job, model_type, self.shared_files.base_uri(), &args))
  }
}

pub struct SmtTransferClearMlBuildJobFactory {
  shared_files: Arc<dyn SharedFileService>,
}

impl SmtTransferClearMlBuildJobFactory {
  pub fn new(shared_files: Arc<dyn SharedFileService>) -> Self {
    Self { shared_files }
  }
}

#[async_trait]
impl ClearMlBuildJobFactory for SmtTransferClearMlBuildJobFactory {
  fn engine_type(&self) -> EngineType {
    EngineType::SmtTransfer
  }

  async fn create_job_script(&self, job: &JobDefinition, model_type: &str) -> Result<String> {
    if job.stage != BuildStage::Train {
      return Err(MachineError::Validation(format!("etapa {:?} no soportada en ClearML", job.stage)));
    }
    Ok(train_script("build_smt_engine", job, model_type, self.shared_files.base_uri(), &[]))
  }
}

pub struct ClearMlBuildJobRunner {
  clearml: Arc<dyn ClearMlService>,
  factories: HashMap<EngineType, Arc<dyn ClearMlBuildJobFactory>>,
  options: ClearMlOptions,
  build_job: BuildJobOptions,
}

impl ClearMlBuildJobRunner {
  pub fn new(clearml: Arc<dyn ClearMlService>,
             factories: Vec<Arc<dyn ClearMlBuildJobFactory>>,
             options: ClearMlOptions,
             build_job: BuildJobOptions)
             -> Self {
    let factories = factories.into_iter().map(|f| (f.engine_type(), f)).collect();
    Self { clearml,
           factories,
           options,
           build_job }
  }

  pub fn project_name(&self, engine_id: &str) -> String {
    format!("{}/{}/{}", self.options.root_project, self.options.project, engine_id)
  }

  async fn project_id(&self, engine_id: &str) -> Result<String> {
    let name = self.project_name(engine_id);
    match self.clearml.get_project_id(&name).await? {
      Some(id) => Ok(id),
      None => Ok(self.clearml.create_project(&name, None).await?),
    }
  }
}

#[async_trait]
impl BuildJobRunner for ClearMlBuildJobRunner {
  fn runner_type(&self) -> BuildJobRunnerType {
    BuildJobRunnerType::ClearMl
  }

  async fn create_engine(&self, engine_id: &str, name: Option<&str>) -> Result<()> {
    let project = self.project_name(engine_id);
    if self.clearml.get_project_id(&project).await?.is_none() {
      let id = self.clearml.create_project(&project, name).await?;
      info!("proyecto {} creado para el motor {}", id, engine_id);
    }
    Ok(())
  }

  async fn delete_engine(&self, engine_id: &str) -> Result<()> {
    if let Some(id) = self.clearml.get_project_id(&self.project_name(engine_id)).await? {
      self.clearml.delete_project(&id).await?;
    }
    Ok(())
  }

  async fn create_job(&self, job: JobDefinition) -> Result<String> {
    let project_id = self.project_id(&job.engine_id).await?;
    if let Some(task) = self.clearml.get_task_by_name(&job.build_id).await? {
      debug!("reutilizando la tarea {} del build {}", task.id, job.build_id);
      return Ok(task.id);
    }
    let factory = self.factories
                      .get(&job.engine_type)
                      .ok_or_else(|| MachineError::Config(format!("sin fábrica ClearML para {}", job.engine_type)))?;
    let script = factory.create_job_script(&job, &self.build_job.model_type).await?;
    Ok(self.clearml
           .create_task(&job.build_id, &project_id, &script, &self.options.docker_image)
           .await?)
  }

  async fn delete_job(&self, job_id: &str) -> Result<bool> {
    Ok(self.clearml.delete_task(job_id).await?)
  }

  async fn enqueue_job(&self, job_id: &str, engine_type: EngineType) -> Result<bool> {
    let queue = self.build_job
                    .queue(engine_type)
                    .ok_or_else(|| MachineError::Config(format!("sin cola ClearML para {engine_type}")))?;
    Ok(self.clearml.enqueue_task(job_id, queue).await?)
  }

  async fn stop_job(&self, job_id: &str) -> Result<bool> {
    Ok(self.clearml.stop_task(job_id).await?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn splits_server_from_folder() {
    assert_eq!(split_base_uri("s3://bucket/machine/"), ("s3://bucket", "machine/"));
    assert_eq!(split_base_uri("memory://machine"), ("memory://machine", ""));
  }
}
