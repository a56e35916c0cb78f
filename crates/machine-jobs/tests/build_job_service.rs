mod common;

use common::Harness;
use data_access::{Repository, Returning};
use machine_clearml::ClearMlTaskStatus;
use machine_domain::{BuildJobRunnerType, BuildJobState, BuildStage, Engine, EngineType};
use machine_jobs::runner::LocalJobState;

async fn start_preprocess(h: &Harness, engine_id: &str, build_id: &str) -> bool {
  h.build_jobs
   .start_build_job(BuildJobRunnerType::Local,
                    EngineType::Echo,
                    engine_id,
                    build_id,
                    BuildStage::Preprocess,
                    None,
                    None)
   .await
   .unwrap()
}

#[tokio::test]
async fn only_one_concurrent_preprocess_wins() {
  let h = Harness::new();
  h.add_engine("e1", EngineType::Echo).await;

  let (a, b) = tokio::join!(start_preprocess(&h, "e1", "b1"), start_preprocess(&h, "e1", "b2"));
  assert!(a ^ b);
  // el job del perdedor se borra
  assert_eq!(h.local.job_count(), 1);

  let engine = h.engine("e1").await;
  let build = engine.current_build.unwrap();
  assert_eq!(build.job_state, BuildJobState::Pending);
  assert_eq!(build.stage, BuildStage::Preprocess);
  assert_eq!(h.local.job_state(&build.job_id), Some(LocalJobState::Enqueued));
}

#[tokio::test]
async fn start_on_missing_engine_is_rejected() {
  let h = Harness::new();
  assert!(!start_preprocess(&h, "missing", "b1").await);
  assert_eq!(h.local.job_count(), 0);
}

#[tokio::test]
async fn cancel_pending_build_removes_it_without_trace() {
  let h = Harness::new();
  h.add_engine("e1", EngineType::Echo).await;
  assert!(start_preprocess(&h, "e1", "b1").await);

  let (build_id, state) = h.build_jobs.cancel_build_job("e1").await.unwrap();
  assert_eq!(build_id.as_deref(), Some("b1"));
  assert_eq!(state, BuildJobState::None);
  assert!(h.engine("e1").await.current_build.is_none());
  assert_eq!(h.local.job_count(), 0);

  // nada que cancelar
  assert_eq!(h.build_jobs.cancel_build_job("e1").await.unwrap(), (None, BuildJobState::None));
}

#[tokio::test]
async fn cancel_active_build_moves_to_canceling() {
  let h = Harness::new();
  h.add_engine("e1", EngineType::Echo).await;
  assert!(start_preprocess(&h, "e1", "b1").await);
  assert!(h.build_jobs.build_job_started("e1", "b1").await.unwrap());
  assert_eq!(h.engine("e1").await.job_state(), BuildJobState::Active);

  let (build_id, state) = h.build_jobs.cancel_build_job("e1").await.unwrap();
  assert_eq!(build_id.as_deref(), Some("b1"));
  assert_eq!(state, BuildJobState::Canceling);
  assert_eq!(h.engine("e1").await.job_state(), BuildJobState::Canceling);

  // un build en cancelación no vuelve a arrancar ni admite otra etapa
  assert!(!h.build_jobs.build_job_started("e1", "b1").await.unwrap());
  let chained = h.build_jobs
                 .start_build_job(BuildJobRunnerType::Local,
                                  EngineType::Echo,
                                  "e1",
                                  "b1",
                                  BuildStage::Train,
                                  None,
                                  None)
                 .await
                 .unwrap();
  assert!(!chained);
  assert!(!start_preprocess(&h, "e1", "b2").await);
}

#[tokio::test]
async fn only_a_complete_build_bumps_the_revision() {
  let h = Harness::new();
  h.add_engine("e1", EngineType::Echo).await;

  assert!(start_preprocess(&h, "e1", "b1").await);
  assert!(h.build_jobs.build_job_finished("e1", "b1", false).await.unwrap());
  assert_eq!(h.engine("e1").await.build_revision, 0);

  assert!(start_preprocess(&h, "e1", "b2").await);
  assert!(h.build_jobs.build_job_started("e1", "b2").await.unwrap());
  assert!(h.build_jobs.build_job_finished("e1", "b2", true).await.unwrap());
  let engine = h.engine("e1").await;
  assert_eq!(engine.build_revision, 1);
  assert!(engine.current_build.is_none());

  // un segundo cierre del mismo build no tiene efecto
  assert!(!h.build_jobs.build_job_finished("e1", "b2", true).await.unwrap());
  assert_eq!(h.engine("e1").await.build_revision, 1);
}

#[tokio::test]
async fn restarting_returns_the_build_to_pending() {
  let h = Harness::new();
  h.add_engine("e1", EngineType::Echo).await;
  assert!(start_preprocess(&h, "e1", "b1").await);
  assert!(h.build_jobs.build_job_started("e1", "b1").await.unwrap());

  assert!(h.build_jobs.build_job_restarting("e1", "b1").await.unwrap());
  let engine = h.engine("e1").await;
  assert_eq!(engine.job_state(), BuildJobState::Pending);
  assert_eq!(engine.build_revision, 0);
  assert!(!h.build_jobs.build_job_restarting("e1", "other").await.unwrap());
}

#[tokio::test]
async fn restarting_does_not_undo_a_cancel() {
  let h = Harness::new();
  h.add_engine("e1", EngineType::Echo).await;
  assert!(start_preprocess(&h, "e1", "b1").await);
  assert!(h.build_jobs.build_job_started("e1", "b1").await.unwrap());
  let (_, state) = h.build_jobs.cancel_build_job("e1").await.unwrap();
  assert_eq!(state, BuildJobState::Canceling);

  assert!(!h.build_jobs.build_job_restarting("e1", "b1").await.unwrap());
  assert_eq!(h.engine("e1").await.job_state(), BuildJobState::Canceling);
}

#[tokio::test]
async fn restarting_a_pending_build_is_rejected() {
  let h = Harness::new();
  h.add_engine("e1", EngineType::Echo).await;
  assert!(start_preprocess(&h, "e1", "b1").await);

  assert!(!h.build_jobs.build_job_restarting("e1", "b1").await.unwrap());
  assert_eq!(h.engine("e1").await.job_state(), BuildJobState::Pending);
}

#[tokio::test]
async fn train_stage_goes_to_the_remote_queue() {
  let h = Harness::new();
  h.add_engine("e1", EngineType::SmtTransfer).await;
  h.build_jobs.create_engine("e1", Some("motor uno")).await.unwrap();
  assert!(start_preprocess(&h, "e1", "b1").await);
  assert!(h.build_jobs.build_job_started("e1", "b1").await.unwrap());

  let started = h.build_jobs
                 .start_build_job(BuildJobRunnerType::ClearMl,
                                  EngineType::SmtTransfer,
                                  "e1",
                                  "b1",
                                  BuildStage::Train,
                                  None,
                                  Some("{\"max_steps\": 10}".into()))
                 .await
                 .unwrap();
  assert!(started);

  let build = h.engine("e1").await.current_build.unwrap();
  assert_eq!(build.build_job_runner, BuildJobRunnerType::ClearMl);
  assert_eq!(build.stage, BuildStage::Train);
  assert_eq!(build.job_state, BuildJobState::Pending);
  assert_eq!(h.clearml.queue_entries("cpu_only"), vec![build.job_id.clone()]);
  let task = h.clearml.task(&build.job_id).unwrap();
  assert_eq!(task.name, "b1");
  assert_eq!(task.status, ClearMlTaskStatus::Queued);
  let script = h.clearml.script(&build.job_id).unwrap();
  assert!(script.contains("build_smt_engine"));
  assert!(script.contains("'build_id': 'b1'"));
  assert!(script.contains("max_steps"));

  assert_eq!(h.build_jobs.get_building_engines(BuildJobRunnerType::ClearMl).await.unwrap().len(), 1);
  assert!(h.build_jobs.get_building_engines(BuildJobRunnerType::Local).await.unwrap().is_empty());
  assert!(h.build_jobs.is_engine_building("e1").await.unwrap());
  assert_eq!(h.build_jobs.get_build("e1", "b1").await.unwrap().unwrap().job_id, build.job_id);
}

#[tokio::test]
async fn cancel_pending_remote_build_deletes_the_task() {
  let h = Harness::new();
  h.add_engine("e1", EngineType::SmtTransfer).await;
  assert!(start_preprocess(&h, "e1", "b1").await);
  assert!(h.build_jobs.build_job_started("e1", "b1").await.unwrap());
  h.build_jobs
   .start_build_job(BuildJobRunnerType::ClearMl,
                    EngineType::SmtTransfer,
                    "e1",
                    "b1",
                    BuildStage::Train,
                    None,
                    None)
   .await
   .unwrap();
  let job_id = h.engine("e1").await.current_build.unwrap().job_id;

  let (_, state) = h.build_jobs.cancel_build_job("e1").await.unwrap();
  assert_eq!(state, BuildJobState::None);
  assert!(h.clearml.task(&job_id).is_none());
  assert!(h.clearml.queue_entries("cpu_only").is_empty());
}

async fn start_collecting(h: &Harness, engine_id: &str) {
  h.engines
   .update(&|e: &Engine| e.engine_id == engine_id,
           &|e: &mut Engine| e.collect_train_segment_pairs = true,
           Returning::Updated)
   .await
   .unwrap()
   .unwrap();
}

#[tokio::test]
async fn closing_a_build_stops_collecting_pairs() {
  let h = Harness::new();
  h.add_engine("e1", EngineType::Echo).await;

  assert!(start_preprocess(&h, "e1", "b1").await);
  start_collecting(&h, "e1").await;
  h.build_jobs.cancel_build_job("e1").await.unwrap();
  assert!(!h.engine("e1").await.collect_train_segment_pairs);

  assert!(start_preprocess(&h, "e1", "b2").await);
  assert!(h.build_jobs.build_job_started("e1", "b2").await.unwrap());
  start_collecting(&h, "e1").await;
  h.build_jobs.cancel_build_job("e1").await.unwrap();
  // en cancelación sigue recogiendo hasta que el job cierra el build
  assert!(h.engine("e1").await.collect_train_segment_pairs);
  assert!(h.build_jobs.build_job_finished("e1", "b2", false).await.unwrap());
  assert!(!h.engine("e1").await.collect_train_segment_pairs);
}
