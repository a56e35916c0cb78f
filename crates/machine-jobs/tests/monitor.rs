mod common;

use common::Harness;
use machine_clearml::{metric_key, ClearMlHyperParameter, ClearMlMetricsEvent, ClearMlOptions, ClearMlTask, ClearMlTaskStatus};
use machine_domain::{BuildJobRunnerType, BuildJobState, BuildPhaseStage, BuildStage, EngineType};
use machine_jobs::job::PostprocessPayload;
use machine_jobs::runner::{BuildJobRunner, ClearMlBuildJobRunner};
use machine_jobs::{BuildJobService, BuildStatus, ClearMlMonitorService, PlatformMessage, SharedFileService};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

/// Motor SMT con el entrenamiento encolado en la cola remota; devuelve el
/// id de la tarea.
async fn queued_train(h: &Harness, engine_id: &str, build_id: &str) -> String {
  h.add_engine(engine_id, EngineType::SmtTransfer).await;
  let preprocess = h.build_jobs
                    .start_build_job(BuildJobRunnerType::Local,
                                     EngineType::SmtTransfer,
                                     engine_id,
                                     build_id,
                                     BuildStage::Preprocess,
                                     None,
                                     None)
                    .await
                    .unwrap();
  assert!(preprocess);
  assert!(h.build_jobs.build_job_started(engine_id, build_id).await.unwrap());
  let train = h.build_jobs
               .start_build_job(BuildJobRunnerType::ClearMl,
                                EngineType::SmtTransfer,
                                engine_id,
                                build_id,
                                BuildStage::Train,
                                None,
                                None)
               .await
               .unwrap();
  assert!(train);
  h.engine(engine_id).await.current_build.unwrap().job_id
}

fn properties(values: &[(&str, &str)]) -> HashMap<String, HashMap<String, ClearMlHyperParameter>> {
  let params = values.iter()
                     .map(|(name, value)| {
                       ((*name).to_string(),
                        ClearMlHyperParameter { section: Some("properties".into()),
                                                name: Some((*name).to_string()),
                                                value: (*value).to_string(),
                                                kind: None,
                                                description: None })
                     })
                     .collect();
  HashMap::from([("properties".to_string(), params)])
}

fn statuses(h: &Harness) -> Vec<BuildStatus> {
  h.messages()
   .into_iter()
   .filter_map(|m| match m {
     PlatformMessage::UpdateBuildStatus { status, .. } => Some(status),
     _ => None,
   })
   .collect()
}

#[tokio::test]
async fn queued_builds_report_their_position() {
  let h = Harness::new();
  let monitor = h.monitor();
  // una tarea ajena más antigua ocupa la primera posición
  let mut foreign = ClearMlTask::new("foreign", "other-build", ClearMlTaskStatus::Queued);
  foreign.created = Some(chrono::Utc::now() - chrono::Duration::minutes(5));
  h.clearml.insert_task(foreign, Some("cpu_only")).unwrap();
  queued_train(&h, "e1", "b1").await;

  monitor.check_builds().await.unwrap();

  assert_eq!(monitor.queue_size(EngineType::SmtTransfer), 2);
  assert_eq!(monitor.queue_size(EngineType::Nmt), 0);
  let reported = statuses(&h);
  assert_eq!(reported.len(), 1);
  assert_eq!(reported[0].queue_depth, Some(2));
  assert_eq!(reported[0].progress.step, 0);
  assert_eq!(reported[0].progress.percent_completed, Some(0.0));
  assert_eq!(reported[0].phases.as_ref().unwrap().len(), 2);

  // el mismo progreso no se vuelve a enviar
  monitor.check_builds().await.unwrap();
  assert_eq!(statuses(&h).len(), 1);
  assert_eq!(h.engine("e1").await.job_state(), BuildJobState::Pending);
}

#[tokio::test]
async fn running_task_starts_the_build_and_reports_progress() {
  let h = Harness::new();
  let monitor = h.monitor();
  let task_id = queued_train(&h, "e1", "b1").await;

  h.clearml.set_status(&task_id, ClearMlTaskStatus::InProgress).unwrap();
  h.clearml
   .update_task(&task_id, |t| {
     t.last_iteration = Some(12);
     t.runtime = Some(HashMap::from([("progress".to_string(), json!("40"))]));
     t.hyperparams = Some(properties(&[("message", "Training"),
                                       ("train_step", "12"),
                                       ("train_step_count", "30"),
                                       ("train_started", "2024-03-01T10:00:00Z")]));
   })
   .unwrap();
  monitor.check_builds().await.unwrap();

  assert_eq!(h.engine("e1").await.job_state(), BuildJobState::Active);
  assert!(h.messages().contains(&PlatformMessage::BuildStarted { build_id: "b1".into() }));
  let last = statuses(&h).pop().unwrap();
  assert_eq!(last.progress.step, 12);
  assert_eq!(last.progress.percent_completed, Some(0.4));
  assert_eq!(last.progress.message.as_deref(), Some("Training"));
  assert_eq!(last.queue_depth, Some(0));
  let train = last.phases
                  .unwrap()
                  .into_iter()
                  .find(|p| p.stage == BuildPhaseStage::Train)
                  .unwrap();
  assert_eq!(train.step, Some(12));
  assert_eq!(train.step_count, Some(30));
  assert!(train.started.is_some());

  let sent = h.outbox.messages().len();
  monitor.check_builds().await.unwrap();
  assert_eq!(h.outbox.messages().len(), sent);
}

#[tokio::test]
async fn completed_task_chains_postprocess_with_metrics() {
  let h = Harness::new();
  let monitor = h.monitor();
  let task_id = queued_train(&h, "e1", "b1").await;

  h.clearml.set_status(&task_id, ClearMlTaskStatus::Completed).unwrap();
  h.clearml
   .update_task(&task_id, |t| {
     let variants = HashMap::from([(metric_key("train_corpus_size"),
                                    ClearMlMetricsEvent { metric: Some("Summary".into()),
                                                          variant: Some("train_corpus_size".into()),
                                                          value: 250.0,
                                                          min_value: None,
                                                          max_value: None }),
                                   (metric_key("confidence"),
                                    ClearMlMetricsEvent { metric: Some("Summary".into()),
                                                          variant: Some("confidence".into()),
                                                          value: 62.5,
                                                          min_value: None,
                                                          max_value: None })]);
     t.last_metrics = Some(HashMap::from([(metric_key("Summary"), variants)]));
   })
   .unwrap();
  monitor.check_builds().await.unwrap();

  let build = h.engine("e1").await.current_build.unwrap();
  assert_eq!(build.stage, BuildStage::Postprocess);
  assert_eq!(build.job_state, BuildJobState::Pending);
  assert_eq!(build.build_job_runner, BuildJobRunnerType::Local);
  let job = h.local.job(&build.job_id).unwrap();
  let payload: PostprocessPayload = serde_json::from_value(job.data.unwrap()).unwrap();
  assert_eq!(payload,
             PostprocessPayload { train_corpus_size: 250,
                                  confidence: 62.5 });
  assert_eq!(statuses(&h).last().unwrap().progress.percent_completed, Some(1.0));
  assert!(h.messages().contains(&PlatformMessage::BuildStarted { build_id: "b1".into() }));
}

#[tokio::test]
async fn stopped_task_cancels_the_build() {
  let h = Harness::new();
  let monitor = h.monitor();
  let task_id = queued_train(&h, "e1", "b1").await;
  h.shared_files.write("builds/b1/train.src.txt", b"hola\n".to_vec()).await.unwrap();

  h.clearml.set_status(&task_id, ClearMlTaskStatus::InProgress).unwrap();
  monitor.check_builds().await.unwrap();
  let (_, state) = h.build_jobs.cancel_build_job("e1").await.unwrap();
  assert_eq!(state, BuildJobState::Canceling);
  assert_eq!(h.clearml.task(&task_id).unwrap().status, ClearMlTaskStatus::Stopped);

  monitor.check_builds().await.unwrap();

  assert!(h.engine("e1").await.current_build.is_none());
  assert!(h.messages().contains(&PlatformMessage::BuildCanceled { build_id: "b1".into() }));
  assert!(!h.shared_files.exists("builds/b1/train.src.txt").await.unwrap());
  assert!(h.build_jobs.get_building_engines(BuildJobRunnerType::ClearMl).await.unwrap().is_empty());
}

#[tokio::test]
async fn completion_racing_a_cancel_finishes_as_canceled() {
  let h = Harness::new();
  let monitor = h.monitor();
  let task_id = queued_train(&h, "e1", "b1").await;

  h.clearml.set_status(&task_id, ClearMlTaskStatus::InProgress).unwrap();
  monitor.check_builds().await.unwrap();
  h.build_jobs.cancel_build_job("e1").await.unwrap();
  // la tarea terminó antes de que llegara la orden de parada
  h.clearml.set_status(&task_id, ClearMlTaskStatus::Completed).unwrap();

  monitor.check_builds().await.unwrap();

  let engine = h.engine("e1").await;
  assert!(engine.current_build.is_none());
  assert_eq!(engine.build_revision, 0);
  assert!(h.messages().contains(&PlatformMessage::BuildCanceled { build_id: "b1".into() }));
}

#[tokio::test]
async fn failed_task_faults_the_build() {
  let h = Harness::new();
  let monitor = h.monitor();
  let task_id = queued_train(&h, "e1", "b1").await;

  h.clearml.set_status(&task_id, ClearMlTaskStatus::Failed).unwrap();
  h.clearml
   .update_task(&task_id, |t| {
     t.status_reason = Some("Script error".into());
     t.status_message = Some("CUDA out of memory".into());
   })
   .unwrap();
  monitor.check_builds().await.unwrap();

  assert!(h.engine("e1").await.current_build.is_none());
  let messages = h.messages();
  assert!(messages.contains(&PlatformMessage::BuildStarted { build_id: "b1".into() }));
  assert!(messages.contains(&PlatformMessage::BuildFaulted { build_id: "b1".into(),
                                                             message: "Script error : CUDA out of memory".into() }));
}

#[tokio::test]
async fn a_broken_build_does_not_block_the_others() {
  let h = Harness::new();
  let broken = queued_train(&h, "e1", "b1").await;
  let healthy = queued_train(&h, "e2", "b2").await;
  // sin runner local, el postproceso de e1 no se puede encolar
  let remote_only: Vec<Arc<dyn BuildJobRunner>> =
    vec![Arc::new(ClearMlBuildJobRunner::new(h.clearml.clone(), Vec::new(), ClearMlOptions::default(), h.options.clone()))];
  let monitor = ClearMlMonitorService::new(h.clearml.clone(),
                                           Arc::new(BuildJobService::new(remote_only, h.engines.clone())),
                                           h.platform.clone(),
                                           h.data_access.clone(),
                                           h.shared_files.clone(),
                                           &h.options);
  h.clearml.set_status(&broken, ClearMlTaskStatus::Completed).unwrap();
  h.clearml.set_status(&healthy, ClearMlTaskStatus::InProgress).unwrap();

  monitor.check_builds().await.unwrap();

  let e1 = h.engine("e1").await;
  assert_eq!(e1.current_build.unwrap().stage, BuildStage::Train);
  assert_eq!(e1.build_revision, 0);
  assert_eq!(h.engine("e2").await.job_state(), BuildJobState::Active);
  assert!(h.messages().contains(&PlatformMessage::BuildStarted { build_id: "b2".into() }));
  assert!(!h.methods().contains(&"build_faulted".to_string()));
}
