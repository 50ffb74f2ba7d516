//! End-to-end pipeline scenarios: provision the stacks, then let ingest
//! notifications drive the ETL job and the cluster step.

#[cfg(test)]
mod tests {
    use crate::core::{ExecutionStatus, JobStatus};
    use crate::dispatch::{DispatcherConfig, EventDispatcher};
    use crate::events::{names, CollectingEventSink};
    use crate::jobs::{ActionOnFailure, ClusterStepRunner, EtlJobRunner, EtlRunState, RunnerRegistry, SecretBinding, StepState};
    use crate::polling::PollConfig;
    use crate::secrets::{CallerKind, CredentialPairGenerator, SecretProvisioner};
    use crate::stacks::{Reconciler, ReconcilerConfig, ResourceDeclaration, ResourceGroupSpec, StackPlan, StackTier};
    use crate::store::{ExportRegistry, InMemoryResourceStore};
    use crate::testing::{ScriptedClusterService, ScriptedEtlService, SimulatedStackBackend};
    use crate::workflow::{EngineConfig, ExecutionStore, WorkflowDefinition, WorkflowEngine};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    fn declared_stacks() -> Vec<ResourceGroupSpec> {
        vec![
            ResourceGroupSpec::new("orchestration", StackTier::Orchestration)
                .depends_on("storage")
                .depends_on("etl")
                .with_resource(ResourceDeclaration::new("Dispatcher", "function"))
                .with_import("IngestBucketName"),
            ResourceGroupSpec::new("network", StackTier::Network)
                .with_resource(ResourceDeclaration::new("Vpc", "vpc")),
            ResourceGroupSpec::new("storage", StackTier::Storage)
                .depends_on("network")
                .with_resource(
                    ResourceDeclaration::new("IngestBucket", "bucket")
                        .with_property("name", serde_json::json!("ingest-data")),
                )
                .with_export("IngestBucketName", "IngestBucket", "id"),
            ResourceGroupSpec::new("etl", StackTier::DataMovement)
                .depends_on("storage")
                .with_resource(ResourceDeclaration::new("IngestJob", "etl_job"))
                .with_import("IngestBucketName"),
        ]
    }

    const PIPELINE: &str = r"
name: ingest-pipeline
startAt: T1
states:
  T1:
    type: task
    runnerKind: etl
    jobKind: ingest-etl
    failurePolicy: T1_POLICY
    parameters:
      input: $.Key
      db_password: '{{resolve:secret:db-credentials:password}}'
    next: T2
  T2:
    type: task
    runnerKind: cluster-step
    jobKind: spark-aggregate
    target: j-CLUSTER
    failurePolicy: T2_POLICY
    parameters:
      entryPoint: s3://scripts/sparkjob1.py
      actionOnFailure: CONTINUE
      args: $.Key
    end: true
";

    struct Pipeline {
        dispatcher: EventDispatcher,
        engine: Arc<WorkflowEngine>,
        etl: Arc<ScriptedEtlService>,
        cluster: Arc<ScriptedClusterService>,
        sink: Arc<CollectingEventSink>,
        ingest_bucket: String,
    }

    async fn provision(t1_policy: &str, t2_policy: &str) -> Pipeline {
        let stacks = Arc::new(SimulatedStackBackend::new());
        let exports = Arc::new(ExportRegistry::new());
        let reconciler = Reconciler::new(stacks.clone(), Arc::new(InMemoryResourceStore::new()))
            .with_exports(exports.clone())
            .with_config(
                ReconcilerConfig::default()
                    .with_group_timeout(Duration::from_secs(5))
                    .with_poll(PollConfig::fixed(Duration::from_millis(2))),
            );
        let plan = StackPlan::new(declared_stacks()).unwrap();
        assert_eq!(plan.ids(), vec!["network", "storage", "etl", "orchestration"]);

        let report = reconciler.reconcile_all(&plan).await;
        assert!(report.success(), "{report}");
        let ingest_bucket = exports.resolve("IngestBucketName").unwrap();
        assert_eq!(stacks.last_imports("orchestration")["IngestBucketName"], ingest_bucket);

        let secrets = Arc::new(SecretProvisioner::default());
        secrets
            .provision("db-credentials", &CredentialPairGenerator::new("admin"))
            .unwrap();

        let etl = Arc::new(ScriptedEtlService::new());
        let cluster = Arc::new(ScriptedClusterService::new());
        let ttl = Duration::from_secs(60);
        let runners = RunnerRegistry::new()
            .with_runner(Arc::new(
                EtlJobRunner::new(etl.clone()).with_secrets(SecretBinding::new(secrets.clone(), CallerKind::EtlJob, ttl)),
            ))
            .with_runner(Arc::new(
                ClusterStepRunner::new(cluster.clone())
                    .with_secrets(SecretBinding::new(secrets, CallerKind::ClusterStep, ttl)),
            ));

        let sink = Arc::new(CollectingEventSink::new());
        let engine = Arc::new(
            WorkflowEngine::new(runners)
                .with_config(
                    EngineConfig::default()
                        .with_poll(PollConfig::fixed(Duration::from_millis(2)))
                        .with_default_task_timeout(Duration::from_secs(30)),
                )
                .with_store(Arc::new(ExecutionStore::new()))
                .with_event_sink(sink.clone()),
        );
        let definition = Arc::new(WorkflowDefinition::from_yaml(
            &PIPELINE.replace("T1_POLICY", t1_policy).replace("T2_POLICY", t2_policy),
        ).unwrap());
        let dispatcher = EventDispatcher::new(DispatcherConfig::new(ingest_bucket.clone()), engine.clone(), definition)
            .with_event_sink(sink.clone());

        Pipeline {
            dispatcher,
            engine,
            etl,
            cluster,
            sink,
            ingest_bucket,
        }
    }

    fn notification(bucket: &str, key: &str) -> serde_json::Value {
        serde_json::json!({
            "Records": [{
                "eventTime": "2024-03-01T12:00:00.000Z",
                "s3": {"bucket": {"name": bucket}, "object": {"key": key, "sequencer": "0055AED6DCD90281E5"}}
            }]
        })
    }

    fn submitted_tasks(sink: &CollectingEventSink) -> Vec<String> {
        sink.events_of_type(names::TASK_SUBMITTED)
            .into_iter()
            .filter_map(|(_, data)| data?.get("task")?.as_str().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_new_object_runs_etl_then_cluster_step() {
        let p = provision("ABORT", "ABORT").await;
        p.etl.script("ingest-etl", vec![EtlRunState::Running, EtlRunState::Succeeded]);
        p.cluster.script(vec![StepState::Pending, StepState::Running, StepState::Completed]);

        let outcomes = p
            .dispatcher
            .dispatch_notification(&notification(&p.ingest_bucket, "incoming/data.csv"))
            .await
            .unwrap();
        let dispatched = outcomes.into_iter().next().unwrap().unwrap();
        p.engine.drain().await;

        let exec = p.engine.execution(&dispatched.execution_id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Succeeded);
        assert_eq!(submitted_tasks(&p.sink), vec!["T1", "T2"]);
        assert!(exec.history.iter().all(|e| e.status == JobStatus::Succeeded));

        let (job, args) = p.etl.last_start().unwrap();
        assert_eq!(job, "ingest-etl");
        assert_eq!(args["--input"], "incoming/data.csv");
        assert_eq!(args["--db_password"].len(), 30);

        let step = p.cluster.last_step().unwrap();
        assert_eq!(step.args[..4], ["spark-submit", "--deploy-mode", "cluster", "s3://scripts/sparkjob1.py"]);
        assert_eq!(step.args[4], "incoming/data.csv");
    }

    #[tokio::test]
    async fn test_redelivered_notification_starts_one_execution() {
        let p = provision("ABORT", "ABORT").await;
        let first = p
            .dispatcher
            .dispatch_notification(&notification(&p.ingest_bucket, "incoming/data.csv"))
            .await
            .unwrap();
        let second = p
            .dispatcher
            .dispatch_notification(&notification(&p.ingest_bucket, "incoming/data.csv"))
            .await
            .unwrap();
        p.engine.drain().await;

        assert!(second[0].as_ref().unwrap().duplicate);
        assert_eq!(
            first[0].as_ref().unwrap().execution_id,
            second[0].as_ref().unwrap().execution_id
        );
        assert_eq!(p.engine.executions().len(), 1);
        assert_eq!(p.etl.start_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_etl_with_continue_still_runs_cluster_step() {
        let p = provision("CONTINUE", "ABORT").await;
        p.etl.script("ingest-etl", vec![EtlRunState::Running, EtlRunState::Failed]);

        let outcomes = p
            .dispatcher
            .dispatch_notification(&notification(&p.ingest_bucket, "incoming/data.csv"))
            .await
            .unwrap();
        let id = outcomes[0].as_ref().unwrap().execution_id.clone();
        p.engine.drain().await;

        let exec = p.engine.execution(&id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Succeeded);
        let t1 = exec.entry("T1").unwrap();
        assert_eq!(t1.status, JobStatus::Failed);
        assert!(t1.continued);
        assert_eq!(exec.entry("T2").map(|e| e.status), Some(JobStatus::Succeeded));
        assert_eq!(submitted_tasks(&p.sink), vec!["T1", "T2"]);
    }

    #[tokio::test]
    async fn test_failed_cluster_step_with_continue_ends_succeeded() {
        let p = provision("ABORT", "CONTINUE").await;
        p.etl.script("ingest-etl", vec![EtlRunState::Running, EtlRunState::Succeeded]);
        p.cluster.script(vec![StepState::Pending, StepState::Running, StepState::Failed]);

        let outcomes = p
            .dispatcher
            .dispatch_notification(&notification(&p.ingest_bucket, "incoming/data.csv"))
            .await
            .unwrap();
        let id = outcomes[0].as_ref().unwrap().execution_id.clone();
        p.engine.drain().await;

        let exec = p.engine.execution(&id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Succeeded);
        assert_eq!(
            exec.history
                .iter()
                .map(|e| (e.state.as_str(), e.status, e.continued))
                .collect::<Vec<_>>(),
            vec![("T1", JobStatus::Succeeded, false), ("T2", JobStatus::Failed, true)]
        );
        assert!(exec.entry("T2").unwrap().error.is_some());
        assert!(exec.error.is_none());
        assert_eq!(
            p.cluster.last_step().map(|step| step.action_on_failure),
            Some(ActionOnFailure::Continue)
        );
        assert_eq!(p.sink.events_of_type(names::TASK_CONTINUED).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_etl_with_abort_skips_cluster_step() {
        let p = provision("ABORT", "ABORT").await;
        p.etl.script("ingest-etl", vec![EtlRunState::Failed]);

        let outcomes = p
            .dispatcher
            .dispatch_notification(&notification(&p.ingest_bucket, "incoming/data.csv"))
            .await
            .unwrap();
        let id = outcomes[0].as_ref().unwrap().execution_id.clone();
        p.engine.drain().await;

        let exec = p.engine.execution(&id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.history.len(), 1);
        assert!(p.cluster.last_step().is_none());
        assert_eq!(p.cluster.add_calls(), 0);
    }

    #[tokio::test]
    async fn test_foreign_bucket_is_rejected() {
        let p = provision("ABORT", "ABORT").await;
        let outcomes = p
            .dispatcher
            .dispatch_notification(&notification("someone-elses-bucket", "x.csv"))
            .await
            .unwrap();
        assert!(outcomes[0].is_err());
        assert!(p.engine.executions().is_empty());
    }
}
