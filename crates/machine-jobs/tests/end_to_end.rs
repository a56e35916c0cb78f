mod common;

use chrono::Utc;
use common::Harness;
use data_access::Repository;
use machine_domain::{BuildJobState, EngineType, ProgressStatus};
use machine_jobs::config::BuildJobOptions;
use machine_jobs::engine_state::{EchoModelFactory, ModelFactory, TrainedModel, TranslationModel};
use machine_jobs::job::CorpusPayload;
use machine_jobs::{MachineError, PlatformMessage, Result, SharedFileService};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

fn corpus(pairs: &[(&str, &str)]) -> CorpusPayload {
  CorpusPayload { source: pairs.iter().map(|(s, _)| s.to_string()).collect(),
                  target: pairs.iter().map(|(_, t)| t.to_string()).collect() }
}

/// Puerta que bloquea un hilo hasta que el test la abre.
#[derive(Default)]
struct Gate {
  entered: AtomicBool,
  open: Mutex<bool>,
  opened: Condvar,
}

impl Gate {
  fn pass(&self) {
    self.entered.store(true, Ordering::SeqCst);
    let mut open = self.open.lock().unwrap();
    while !*open {
      open = self.opened.wait(open).unwrap();
    }
  }

  fn release(&self) {
    *self.open.lock().unwrap() = true;
    self.opened.notify_all();
  }

  /// Vuelve a cerrar la puerta para el siguiente paso.
  fn close(&self) {
    *self.open.lock().unwrap() = false;
    self.entered.store(false, Ordering::SeqCst);
  }

  async fn wait_entered(&self) {
    for _ in 0..500 {
      if self.entered.load(Ordering::SeqCst) {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("nadie llegó a la puerta");
  }
}

/// Fábrica echo cuyo entrenamiento espera a que el test abra la puerta.
#[derive(Default)]
struct GatedFactory {
  inner: EchoModelFactory,
  gate: Gate,
}

impl ModelFactory for GatedFactory {
  fn init_new(&self, engine_dir: &Path) -> Result<()> {
    self.inner.init_new(engine_dir)
  }

  fn create(&self, engine_dir: &Path) -> Result<Box<dyn TranslationModel>> {
    self.inner.create(engine_dir)
  }

  fn train(&self, source: &[String], target: &[String], progress: &dyn Fn(ProgressStatus)) -> Result<TrainedModel> {
    self.gate.pass();
    self.inner.train(source, target, progress)
  }

  fn install(&self, engine_dir: &Path, artifact: &[u8]) -> Result<()> {
    self.inner.install(engine_dir, artifact)
  }

  fn cleanup(&self, engine_dir: &Path) -> Result<()> {
    self.inner.cleanup(engine_dir)
  }
}

/// Fábrica echo cuya instalación espera a la puerta.
#[derive(Default)]
struct SlowInstallFactory {
  inner: EchoModelFactory,
  gate: Gate,
}

impl ModelFactory for SlowInstallFactory {
  fn init_new(&self, engine_dir: &Path) -> Result<()> {
    self.inner.init_new(engine_dir)
  }

  fn create(&self, engine_dir: &Path) -> Result<Box<dyn TranslationModel>> {
    self.inner.create(engine_dir)
  }

  fn train(&self, source: &[String], target: &[String], progress: &dyn Fn(ProgressStatus)) -> Result<TrainedModel> {
    self.inner.train(source, target, progress)
  }

  fn install(&self, engine_dir: &Path, artifact: &[u8]) -> Result<()> {
    self.gate.pass();
    self.inner.install(engine_dir, artifact)
  }

  fn cleanup(&self, engine_dir: &Path) -> Result<()> {
    self.inner.cleanup(engine_dir)
  }
}

#[tokio::test]
async fn build_then_translate_and_train() {
  let h = Harness::new();
  let workers = h.start_workers(2);
  let svc = h.engine_service();
  let engine = svc.create_engine("e1", Some("uno"), EngineType::Echo, "es", "en", None)
                  .await
                  .unwrap();
  assert!(engine.is_model_persisted);

  let err = svc.translate("e1", "hola").await.unwrap_err();
  assert!(matches!(err, MachineError::EngineNotBuilt(_)));

  svc.start_build("e1", "b1", corpus(&[("hola", "hello"), ("adiós", "goodbye")]), None)
     .await
     .unwrap();
  let engine = h.wait_for_engine("e1", |e| e.build_revision == 1).await;
  assert!(engine.current_build.is_none());

  assert_eq!(svc.translate("e1", "hola").await.unwrap(), "hello");
  assert_eq!(svc.translate("e1", "sin entrenar").await.unwrap(), "sin entrenar");

  let methods = h.methods();
  let position = |m: &str| methods.iter().position(|x| x == m).unwrap();
  assert!(position("update_build_execution_data") < position("build_started"));
  assert!(position("build_started") < position("update_build_status"));
  assert_eq!(methods.last().map(String::as_str), Some("build_completed"));
  assert!(h.messages().contains(&PlatformMessage::BuildCompleted { build_id: "b1".into(),
                                                                    train_size: 2,
                                                                    confidence: 100.0 }));
  // los ficheros del build se borran al cerrar
  assert!(!h.shared_files.exists("builds/b1/train.src.txt").await.unwrap());

  svc.train_segment("e1", "gato", "cat").await.unwrap();
  assert_eq!(svc.translate("e1", "gato").await.unwrap(), "cat");
  assert!(h.train_segment_pairs.is_empty());
  assert_eq!(h.messages().last(),
             Some(&PlatformMessage::IncrementTrainSize { engine_id: "e1".into(),
                                                         count: 1 }));

  h.local.shutdown();
  for worker in workers {
    worker.await.unwrap();
  }
}

#[tokio::test]
async fn build_requests_are_validated() {
  let h = Harness::new();
  let svc = h.engine_service();
  svc.create_engine("e1", None, EngineType::Echo, "es", "en", None).await.unwrap();

  let err = svc.cancel_build("e1").await.unwrap_err();
  assert!(matches!(err, MachineError::NotBuilding(_)));

  svc.start_build("e1", "b1", CorpusPayload::default(), None).await.unwrap();
  let err = svc.start_build("e1", "b2", CorpusPayload::default(), None).await.unwrap_err();
  assert!(matches!(err, MachineError::AlreadyBuilding(_)));

  let err = svc.start_build("missing", "b3", CorpusPayload::default(), None).await.unwrap_err();
  assert!(matches!(err, MachineError::EngineNotFound(_)));

  let err = svc.create_engine("smt", None, EngineType::SmtTransfer, "es", "en", Some(false))
               .await
               .unwrap_err();
  assert!(matches!(err, MachineError::Validation(_)));
  assert!(h.engines.get_by_id("smt").await.unwrap().is_none());
}

#[tokio::test]
async fn canceling_a_pending_build_notifies_the_platform() {
  let h = Harness::new();
  let svc = h.engine_service();
  svc.create_engine("e1", None, EngineType::Echo, "es", "en", None).await.unwrap();
  svc.start_build("e1", "b1", CorpusPayload::default(), None).await.unwrap();

  let (build_id, state) = svc.cancel_build("e1").await.unwrap();

  assert_eq!(build_id, "b1");
  assert_eq!(state, BuildJobState::None);
  assert_eq!(h.messages(), vec![PlatformMessage::BuildCanceled { build_id: "b1".into() }]);
}

#[tokio::test]
async fn second_cancel_of_an_active_build_is_rejected() {
  let h = Harness::new();
  let svc = h.engine_service();
  svc.create_engine("e1", None, EngineType::Echo, "es", "en", None).await.unwrap();
  svc.start_build("e1", "b1", CorpusPayload::default(), None).await.unwrap();
  assert!(h.build_jobs.build_job_started("e1", "b1").await.unwrap());

  let (_, state) = svc.cancel_build("e1").await.unwrap();
  assert_eq!(state, BuildJobState::Canceling);
  let err = svc.cancel_build("e1").await.unwrap_err();
  assert!(matches!(err, MachineError::AlreadyCanceling(_)));
  // el job activo notificará la cancelación al terminar
  assert!(h.messages().is_empty());
}

#[tokio::test]
async fn cancel_during_training_discards_the_result() {
  let factory = Arc::new(GatedFactory::default());
  let h = Harness::with_factory(BuildJobOptions::default(), Some(factory.clone() as Arc<dyn ModelFactory>));
  let workers = h.start_workers(1);
  let svc = h.engine_service();
  svc.create_engine("e1", None, EngineType::Echo, "es", "en", None).await.unwrap();
  svc.start_build("e1", "b1", corpus(&[("hola", "hello")]), None).await.unwrap();

  factory.gate.wait_entered().await;

  let (build_id, state) = svc.cancel_build("e1").await.unwrap();
  assert_eq!(build_id, "b1");
  assert_eq!(state, BuildJobState::Canceling);
  factory.gate.release();

  let engine = h.wait_for_engine("e1", |e| e.current_build.is_none()).await;
  assert_eq!(engine.build_revision, 0);
  let methods = h.methods();
  assert!(methods.contains(&"build_canceled".to_string()));
  assert!(!methods.contains(&"build_completed".to_string()));
  assert!(!methods.contains(&"build_restarting".to_string()));
  assert!(!h.shared_files.exists("builds/b1/model.bin").await.unwrap());

  h.local.shutdown();
  for worker in workers {
    worker.await.unwrap();
  }
}

#[tokio::test]
async fn deleting_an_engine_releases_everything() {
  let h = Harness::new();
  let workers = h.start_workers(1);
  let svc = h.engine_service();
  svc.create_engine("e1", None, EngineType::Echo, "es", "en", None).await.unwrap();
  svc.start_build("e1", "b1", corpus(&[("hola", "hello")]), None).await.unwrap();
  h.wait_for_engine("e1", |e| e.build_revision == 1).await;
  svc.translate("e1", "hola").await.unwrap();
  assert!(h.echo.exists(Path::new("engines/e1")));

  svc.delete_engine("e1").await.unwrap();

  assert!(h.engines.get_by_id("e1").await.unwrap().is_none());
  assert!(h.lock_docs.get_by_id("e1").await.unwrap().is_none());
  assert!(!h.echo.exists(Path::new("engines/e1")));
  assert!(h.states.get("e1").is_none());
  let err = svc.translate("e1", "hola").await.unwrap_err();
  assert!(matches!(err, MachineError::EngineNotFound(_)));

  h.local.shutdown();
  for worker in workers {
    worker.await.unwrap();
  }
}

#[tokio::test]
async fn segments_trained_during_a_build_survive_it() {
  let factory = Arc::new(GatedFactory::default());
  let h = Harness::with_factory(BuildJobOptions::default(), Some(factory.clone() as Arc<dyn ModelFactory>));
  let workers = h.start_workers(1);
  let svc = h.engine_service();
  svc.create_engine("e1", None, EngineType::Echo, "es", "en", None).await.unwrap();
  factory.gate.release();
  svc.start_build("e1", "b1", corpus(&[("hola", "hello")]), None).await.unwrap();
  h.wait_for_engine("e1", |e| e.build_revision == 1).await;

  factory.gate.close();
  svc.start_build("e1", "b2", corpus(&[("hola", "hi"), ("perro", "dog")]), None)
     .await
     .unwrap();
  factory.gate.wait_entered().await;
  assert!(h.engine("e1").await.collect_train_segment_pairs);

  svc.train_segment("e1", "gato", "cat").await.unwrap();
  assert_eq!(svc.translate("e1", "gato").await.unwrap(), "cat");
  assert_eq!(h.train_segment_pairs.len(), 1);

  factory.gate.release();
  let engine = h.wait_for_engine("e1", |e| e.build_revision == 2).await;
  assert!(!engine.collect_train_segment_pairs);
  assert_eq!(svc.translate("e1", "gato").await.unwrap(), "cat");
  assert_eq!(svc.translate("e1", "hola").await.unwrap(), "hi");
  assert_eq!(svc.translate("e1", "perro").await.unwrap(), "dog");

  h.local.shutdown();
  for worker in workers {
    worker.await.unwrap();
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn model_install_holds_the_lock_for_the_save_timeout() {
  let factory = Arc::new(SlowInstallFactory::default());
  let h = Harness::with_factory(BuildJobOptions::default(), Some(factory.clone() as Arc<dyn ModelFactory>));
  let workers = h.start_workers(1);
  let svc = h.engine_service();
  svc.create_engine("e1", None, EngineType::Echo, "es", "en", None).await.unwrap();
  svc.start_build("e1", "b1", corpus(&[("hola", "hello")]), None).await.unwrap();

  factory.gate.wait_entered().await;
  let lease = h.lock_docs.get_by_id("e1").await.unwrap().unwrap().writer_lock.unwrap();
  let save_timeout = chrono::Duration::from_std(h.states.options().save_model_timeout).unwrap();
  // el lease por defecto del harness es de 30 segundos
  assert!(lease.expires_at - Utc::now() > save_timeout - chrono::Duration::seconds(10));

  factory.gate.release();
  h.wait_for_engine("e1", |e| e.build_revision == 1).await;
  assert_eq!(svc.translate("e1", "hola").await.unwrap(), "hello");

  h.local.shutdown();
  for worker in workers {
    worker.await.unwrap();
  }
}
