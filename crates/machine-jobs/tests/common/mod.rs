#![allow(dead_code)]
// Colaboradores en memoria cableados como en el binario.

use data_access::{MemoryDataAccessContext, MemoryRepository, Repository};
use machine_clearml::{ClearMlOptions, InMemoryClearMlService};
use machine_domain::{Engine, EngineType, LockDocument, TrainSegmentPair};
use machine_jobs::config::{BuildJobOptions, EngineOptions};
use machine_jobs::engine_state::{EchoModelFactory, EngineStateService, ModelFactory};
use machine_jobs::job::{BuildJobContext, StageJobExecutor};
use machine_jobs::runner::{BuildJobRunner, ClearMlBuildJobFactory, ClearMlBuildJobRunner, LocalBuildJobRunner, NmtClearMlBuildJobFactory,
                           SmtTransferClearMlBuildJobFactory};
use machine_jobs::{BuildJobService, ClearMlMonitorService, MemoryOutbox, MemorySharedFileService, OutboxPlatformService,
                   PlatformMessage, TranslationEngineService};
use machine_lock::{LockFactory, LockOptions};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct Harness {
  pub engines: Arc<MemoryRepository<Engine>>,
  pub train_segment_pairs: Arc<MemoryRepository<TrainSegmentPair>>,
  pub lock_docs: Arc<MemoryRepository<LockDocument>>,
  pub data_access: Arc<MemoryDataAccessContext>,
  pub outbox: Arc<MemoryOutbox>,
  pub platform: Arc<OutboxPlatformService<Arc<MemoryOutbox>>>,
  pub shared_files: Arc<MemorySharedFileService>,
  pub locks: Arc<LockFactory>,
  pub clearml: Arc<InMemoryClearMlService>,
  pub local: Arc<LocalBuildJobRunner>,
  pub build_jobs: Arc<BuildJobService>,
  pub echo: EchoModelFactory,
  pub states: Arc<EngineStateService>,
  pub ctx: Arc<BuildJobContext>,
  pub options: BuildJobOptions,
}

impl Harness {
  pub fn new() -> Self {
    Self::with_factory(BuildJobOptions::default(), None)
  }

  /// `factory` sustituye al modelo echo para los motores Echo.
  pub fn with_factory(options: BuildJobOptions, factory: Option<Arc<dyn ModelFactory>>) -> Self {
    let engines = Arc::new(MemoryRepository::<Engine>::new());
    let train_segment_pairs = Arc::new(MemoryRepository::<TrainSegmentPair>::new());
    let lock_docs = Arc::new(MemoryRepository::<LockDocument>::new());
    let data_access = Arc::new(MemoryDataAccessContext::new());
    let outbox = Arc::new(MemoryOutbox::new());
    let platform = Arc::new(OutboxPlatformService::new(outbox.clone()));
    let shared_files = Arc::new(MemorySharedFileService::new());
    let locks = Arc::new(LockFactory::new(lock_docs.clone(),
                                          "test-host",
                                          LockOptions { default_lifetime: Duration::from_secs(30),
                                                        acquire_timeout: Duration::from_secs(5) }));

    let clearml = Arc::new(InMemoryClearMlService::new());
    clearml.add_queue("production").unwrap();
    clearml.add_queue("cpu_only").unwrap();
    let local = Arc::new(LocalBuildJobRunner::new());
    let clearml_factories: Vec<Arc<dyn ClearMlBuildJobFactory>> =
      vec![Arc::new(NmtClearMlBuildJobFactory::new(engines.clone(), shared_files.clone())),
           Arc::new(SmtTransferClearMlBuildJobFactory::new(shared_files.clone()))];
    let clearml_runner = Arc::new(ClearMlBuildJobRunner::new(clearml.clone(),
                                                             clearml_factories,
                                                             ClearMlOptions::default(),
                                                             options.clone()));
    let runners: Vec<Arc<dyn BuildJobRunner>> = vec![local.clone(), clearml_runner];
    let build_jobs = Arc::new(BuildJobService::new(runners, engines.clone()));

    let echo = EchoModelFactory::new();
    let echo_factory: Arc<dyn ModelFactory> = factory.unwrap_or_else(|| Arc::new(echo.clone()) as Arc<dyn ModelFactory>);
    let factories: HashMap<EngineType, Arc<dyn ModelFactory>> =
      [(EngineType::Echo, echo_factory), (EngineType::SmtTransfer, Arc::new(echo.clone()) as Arc<dyn ModelFactory>)].into_iter()
                                                                                                                    .collect();
    let states = Arc::new(EngineStateService::new(factories, EngineOptions::default()));

    let ctx = Arc::new(BuildJobContext { engines: engines.clone(),
                                         train_segment_pairs: train_segment_pairs.clone(),
                                         data_access: data_access.clone(),
                                         build_jobs: build_jobs.clone(),
                                         platform: platform.clone(),
                                         shared_files: shared_files.clone(),
                                         locks: locks.clone(),
                                         engine_states: states.clone(),
                                         options: options.clone() });
    Self { engines,
           train_segment_pairs,
           lock_docs,
           data_access,
           outbox,
           platform,
           shared_files,
           locks,
           clearml,
           local,
           build_jobs,
           echo,
           states,
           ctx,
           options }
  }

  pub fn start_workers(&self, workers: usize) -> Vec<JoinHandle<()>> {
    self.local.start(Arc::new(StageJobExecutor::new(self.ctx.clone())), workers)
  }

  pub fn monitor(&self) -> ClearMlMonitorService {
    ClearMlMonitorService::new(self.clearml.clone(),
                               self.build_jobs.clone(),
                               self.platform.clone(),
                               self.data_access.clone(),
                               self.shared_files.clone(),
                               &self.options)
  }

  pub fn engine_service(&self) -> TranslationEngineService {
    TranslationEngineService::new(self.engines.clone(),
                                  self.train_segment_pairs.clone(),
                                  self.data_access.clone(),
                                  self.build_jobs.clone(),
                                  self.platform.clone(),
                                  self.locks.clone(),
                                  self.states.clone())
  }

  /// Inserta el motor y su documento de lock.
  pub async fn add_engine(&self, engine_id: &str, engine_type: EngineType) -> Engine {
    let engine = self.engines
                     .insert(Engine::new(engine_id, engine_type, "es", "en"))
                     .await
                     .unwrap();
    self.locks.create(engine_id).await.unwrap();
    engine
  }

  pub async fn engine(&self, engine_id: &str) -> Engine {
    self.engines.get_by_id(engine_id).await.unwrap().unwrap()
  }

  /// Espera hasta que el motor cumpla `pred`; falla a los 5 segundos.
  pub async fn wait_for_engine(&self, engine_id: &str, pred: impl Fn(&Engine) -> bool) -> Engine {
    for _ in 0..500 {
      if let Some(engine) = self.engines.get_by_id(engine_id).await.unwrap() {
        if pred(&engine) {
          return engine;
        }
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("el motor {engine_id} no alcanzó el estado esperado: {:?}", self.engines.get_by_id(engine_id).await);
  }

  pub fn methods(&self) -> Vec<String> {
    self.outbox.messages().into_iter().map(|m| m.method).collect()
  }

  pub fn messages(&self) -> Vec<PlatformMessage> {
    self.outbox.platform_messages().unwrap()
  }
}
