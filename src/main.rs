use data_access::{MemoryDataAccessContext, MemoryRepository, Repository};
use log::{info, warn};
use machine_clearml::{ClearMlService, HttpClearMlAuthService, HttpClearMlService, InMemoryClearMlService};
use machine_domain::{Engine, EngineType, LockDocument, TrainSegmentPair};
use machine_jobs::engine_state::{EchoModelFactory, EngineCommitService, EngineStateService, ModelFactory};
use machine_jobs::job::{BuildJobContext, CorpusPayload, StageJobExecutor};
use machine_jobs::runner::{BuildJobRunner, ClearMlBuildJobFactory, ClearMlBuildJobRunner, LocalBuildJobRunner,
                           NmtClearMlBuildJobFactory, SmtTransferClearMlBuildJobFactory};
use machine_jobs::{spawn_recurrent, BuildJobService, ClearMlMonitorService, MachineConfig, MemoryOutbox,
                   MemorySharedFileService, OutboxPlatformService, TranslationEngineService};
use machine_lock::LockFactory;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Arranca un host con almacenamiento en memoria: runner local, commit
/// periódico de motores y, si está habilitado, el monitor de ClearML.
/// Después construye un motor echo de demostración y traduce un segmento.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
  tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
                           .init();

  let config = MachineConfig::from_env()?;
  info!("host {} iniciando", config.service.service_id);

  let engines = Arc::new(MemoryRepository::<Engine>::new());
  let train_segment_pairs = Arc::new(MemoryRepository::<TrainSegmentPair>::new());
  let lock_docs = Arc::new(MemoryRepository::<LockDocument>::new());
  let data_access = Arc::new(MemoryDataAccessContext::new());
  let outbox = Arc::new(MemoryOutbox::new());
  let platform = Arc::new(OutboxPlatformService::new(outbox.clone()));
  let shared_files = Arc::new(MemorySharedFileService::new());
  let locks = Arc::new(LockFactory::new(lock_docs, &config.service.service_id, config.lock.clone()));
  locks.init().await?;

  let clearml: Arc<dyn ClearMlService> = if config.clearml.build_polling_enabled {
    let client = HttpClearMlService::build_client(&config.clearml)?;
    let auth = Arc::new(HttpClearMlAuthService::new(client.clone(), config.clearml.clone()));
    Arc::new(HttpClearMlService::new(client, config.clearml.clone(), auth))
  } else {
    let stub = InMemoryClearMlService::new();
    for queue in config.build_job.clearml_queues.values() {
      stub.add_queue(queue)?;
    }
    Arc::new(stub)
  };

  let local = Arc::new(LocalBuildJobRunner::new());
  let clearml_factories: Vec<Arc<dyn ClearMlBuildJobFactory>> =
    vec![Arc::new(NmtClearMlBuildJobFactory::new(engines.clone(), shared_files.clone())),
         Arc::new(SmtTransferClearMlBuildJobFactory::new(shared_files.clone()))];
  let clearml_runner = Arc::new(ClearMlBuildJobRunner::new(clearml.clone(),
                                                           clearml_factories,
                                                           config.clearml.clone(),
                                                           config.build_job.clone()));
  let runners: Vec<Arc<dyn BuildJobRunner>> = vec![local.clone(), clearml_runner];
  let build_jobs = Arc::new(BuildJobService::new(runners, engines.clone()));

  let echo: Arc<dyn ModelFactory> = Arc::new(EchoModelFactory::new());
  let factories: HashMap<EngineType, Arc<dyn ModelFactory>> =
    [(EngineType::Echo, echo.clone()), (EngineType::SmtTransfer, echo)].into_iter().collect();
  let states = Arc::new(EngineStateService::new(factories, config.engine.clone()));

  let ctx = Arc::new(BuildJobContext { engines: engines.clone(),
                                       train_segment_pairs: train_segment_pairs.clone(),
                                       data_access: data_access.clone(),
                                       build_jobs: build_jobs.clone(),
                                       platform: platform.clone(),
                                       shared_files: shared_files.clone(),
                                       locks: locks.clone(),
                                       engine_states: states.clone(),
                                       options: config.build_job.clone() });

  let shutdown = CancellationToken::new();
  let mut handles = local.start(Arc::new(StageJobExecutor::new(ctx)), config.build_job.local_workers);
  let commit = Arc::new(EngineCommitService::new(states.clone(), engines.clone(), locks.clone()));
  handles.push(spawn_recurrent(commit, config.engine.engine_commit_frequency, shutdown.clone()));

  let mut service = TranslationEngineService::new(engines.clone(),
                                                  train_segment_pairs,
                                                  data_access.clone(),
                                                  build_jobs.clone(),
                                                  platform.clone(),
                                                  locks.clone(),
                                                  states.clone());
  if config.clearml.build_polling_enabled {
    let monitor = Arc::new(ClearMlMonitorService::new(clearml,
                                                      build_jobs,
                                                      platform,
                                                      data_access,
                                                      shared_files,
                                                      &config.build_job));
    handles.push(spawn_recurrent(monitor.clone(), config.clearml.build_polling_timeout, shutdown.clone()));
    service = service.with_monitor(monitor);
  }

  tokio::select! {
    result = demo(&service, engines.as_ref()) => {
      if let Err(e) = result {
        warn!("la demostración falló: {}", e);
      }
    }
    _ = tokio::signal::ctrl_c() => info!("señal de parada recibida"),
  }

  shutdown.cancel();
  local.shutdown();
  for handle in handles {
    if let Err(e) = handle.await {
      warn!("una tarea de fondo terminó con error: {}", e);
    }
  }
  states.shutdown().await;
  info!("{} mensajes pendientes en el outbox", outbox.messages().len());
  Ok(())
}

async fn demo(service: &TranslationEngineService, engines: &dyn Repository<Engine>) -> Result<(), Box<dyn Error>> {
  service.create_engine("demo", Some("demo"), EngineType::Echo, "es", "en", None).await?;
  let corpus = CorpusPayload { source: vec!["hola".into(), "mundo".into()],
                               target: vec!["hello".into(), "world".into()] };
  service.start_build("demo", "demo-build-1", corpus, None).await?;

  loop {
    let built = engines.get_by_id("demo").await?.is_some_and(|e| e.build_revision > 0);
    if built {
      break;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
  }

  let translation = service.translate("demo", "hola mundo").await?;
  info!("'hola mundo' -> '{}'", translation);
  let translation = service.translate("demo", "hola").await?;
  info!("'hola' -> '{}'", translation);
  Ok(())
}
