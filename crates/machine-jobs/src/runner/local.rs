// Archivo: runner/local.rs
// Propósito: planificador en proceso. Los jobs se crean programados, pasan a
// la cola al encolarlos y los consume un grupo de workers de tokio.
use super::{BuildJobExecutor, BuildJobRunner, JobDefinition};
use crate::errors::{MachineError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use machine_domain::{BuildJobRunnerType, EngineType};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalJobState {
  /// Creado pero todavía no elegible.
  Scheduled,
  Enqueued,
  Processing,
  /// Terminó con un error distinto de la cancelación; se conserva para
  /// inspección hasta superar el límite de jobs fallidos.
  Failed,
}

/// Jobs fallidos que se conservan por defecto.
pub const DEFAULT_FAILED_JOB_LIMIT: usize = 100;

struct LocalJob {
  definition: JobDefinition,
  state: LocalJobState,
  token: Option<CancellationToken>,
}

struct Inner {
  jobs: DashMap<String, LocalJob>,
  /// Ids de los jobs fallidos, del más antiguo al más reciente.
  failed: Mutex<VecDeque<String>>,
  failed_limit: usize,
  sender: mpsc::UnboundedSender<String>,
  receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

pub struct LocalBuildJobRunner {
  inner: Arc<Inner>,
  shutdown: Mutex<CancellationToken>,
}

impl Default for LocalBuildJobRunner {
  fn default() -> Self {
    Self::new()
  }
}

impl LocalBuildJobRunner {
  pub fn new() -> Self {
    Self::with_failed_job_limit(DEFAULT_FAILED_JOB_LIMIT)
  }

  /// Runner que conserva como mucho `limit` jobs fallidos; al superarlo se
  /// olvida el más antiguo.
  pub fn with_failed_job_limit(limit: usize) -> Self {
    let (sender, receiver) = mpsc::unbounded_channel();
    Self { inner: Arc::new(Inner { jobs: DashMap::new(),
                                   failed: Mutex::new(VecDeque::new()),
                                   failed_limit: limit,
                                   sender,
                                   receiver: tokio::sync::Mutex::new(receiver) }),
           shutdown: Mutex::new(CancellationToken::new()) }
  }

  /// Lanza `workers` tareas que consumen la cola hasta `shutdown`.
  pub fn start(&self, executor: Arc<dyn BuildJobExecutor>, workers: usize) -> Vec<JoinHandle<()>> {
    let token = CancellationToken::new();
    *self.shutdown.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
    info!("iniciando {} workers locales", workers);
    (0..workers).map(|n| {
                  let inner = self.inner.clone();
                  let executor = executor.clone();
                  let token = token.clone();
                  tokio::spawn(async move { inner.work(n, executor, token).await })
                })
                .collect()
  }

  /// Detiene los workers. Los jobs en curso reciben la cancelación y, si
  /// siguen existiendo, vuelven a la cola para el próximo `start`.
  pub fn shutdown(&self) {
    self.shutdown.lock().unwrap_or_else(PoisonError::into_inner).cancel();
  }

  pub fn job_state(&self, job_id: &str) -> Option<LocalJobState> {
    self.inner.jobs.get(job_id).map(|j| j.state)
  }

  pub fn job(&self, job_id: &str) -> Option<JobDefinition> {
    self.inner.jobs.get(job_id).map(|j| j.definition.clone())
  }

  pub fn job_count(&self) -> usize {
    self.inner.jobs.len()
  }
}

impl Inner {
  async fn work(&self, worker: usize, executor: Arc<dyn BuildJobExecutor>, shutdown: CancellationToken) {
    loop {
      let job_id = {
        let mut receiver = self.receiver.lock().await;
        tokio::select! {
          biased;
          _ = shutdown.cancelled() => break,
          next = receiver.recv() => match next {
            Some(id) => id,
            None => break,
          },
        }
      };
      let Some((definition, token)) = self.claim(&job_id, &shutdown) else {
        continue;
      };
      debug!("worker {} ejecuta {} ({:?} de {})", worker, job_id, definition.stage, definition.build_id);
      let result = executor.execute(&definition, token).await;
      self.complete(&job_id, result);
    }
    debug!("worker {} detenido", worker);
  }

  fn claim(&self, job_id: &str, shutdown: &CancellationToken) -> Option<(JobDefinition, CancellationToken)> {
    let mut job = self.jobs.get_mut(job_id)?;
    if job.state != LocalJobState::Enqueued {
      return None;
    }
    let token = shutdown.child_token();
    job.state = LocalJobState::Processing;
    job.token = Some(token.clone());
    Some((job.definition.clone(), token))
  }

  fn complete(&self, job_id: &str, result: Result<()>) {
    match result {
      Ok(()) => {
        self.jobs.remove(job_id);
      }
      Err(e) if e.is_canceled() => {
        let Some(mut job) = self.jobs.get_mut(job_id) else {
          return;
        };
        job.state = LocalJobState::Enqueued;
        job.token = None;
        drop(job);
        info!("job {} interrumpido, vuelve a la cola", job_id);
        if self.sender.send(job_id.to_string()).is_err() {
          warn!("cola local cerrada; {} no se reencola", job_id);
        }
      }
      Err(e) => {
        error!("job {} fallido: {}", job_id, e);
        let Some(mut job) = self.jobs.get_mut(job_id) else {
          return;
        };
        job.state = LocalJobState::Failed;
        job.token = None;
        drop(job);
        self.retain_failed(job_id);
      }
    }
  }

  fn retain_failed(&self, job_id: &str) {
    let mut failed = self.failed.lock().unwrap_or_else(PoisonError::into_inner);
    failed.push_back(job_id.to_string());
    while failed.len() > self.failed_limit {
      let Some(oldest) = failed.pop_front() else {
        break;
      };
      if self.jobs.remove_if(&oldest, |_, j| j.state == LocalJobState::Failed).is_some() {
        debug!("job fallido {} olvidado", oldest);
      }
    }
  }

  fn forget_failed(&self, job_id: &str) {
    self.failed
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .retain(|id| id != job_id);
  }
}

#[async_trait]
impl BuildJobRunner for LocalBuildJobRunner {
  fn runner_type(&self) -> BuildJobRunnerType {
    BuildJobRunnerType::Local
  }

  async fn create_engine(&self, _engine_id: &str, _name: Option<&str>) -> Result<()> {
    Ok(())
  }

  async fn delete_engine(&self, _engine_id: &str) -> Result<()> {
    Ok(())
  }

  async fn create_job(&self, job: JobDefinition) -> Result<String> {
    let id = Uuid::new_v4().simple().to_string();
    self.inner.jobs.insert(id.clone(),
                           LocalJob { definition: job,
                                      state: LocalJobState::Scheduled,
                                      token: None });
    Ok(id)
  }

  async fn delete_job(&self, job_id: &str) -> Result<bool> {
    match self.inner.jobs.remove(job_id) {
      Some((_, job)) => {
        if let Some(token) = job.token {
          token.cancel();
        }
        if job.state == LocalJobState::Failed {
          self.inner.forget_failed(job_id);
        }
        Ok(true)
      }
      None => Ok(false),
    }
  }

  async fn enqueue_job(&self, job_id: &str, _engine_type: EngineType) -> Result<bool> {
    {
      let Some(mut job) = self.inner.jobs.get_mut(job_id) else {
        return Ok(false);
      };
      if job.state == LocalJobState::Processing {
        return Ok(false);
      }
      job.state = LocalJobState::Enqueued;
    }
    self.inner
        .sender
        .send(job_id.to_string())
        .map_err(|_| MachineError::Validation("la cola local está cerrada".into()))?;
    Ok(true)
  }

  async fn stop_job(&self, job_id: &str) -> Result<bool> {
    let processing = match self.inner.jobs.get(job_id) {
      None => return Ok(false),
      Some(job) => match (&job.state, &job.token) {
        (LocalJobState::Processing, Some(token)) => {
          token.cancel();
          true
        }
        _ => false,
      },
    };
    if !processing {
      self.inner.jobs.remove(job_id);
    }
    Ok(true)
  }
}
