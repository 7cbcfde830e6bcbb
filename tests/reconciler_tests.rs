//! Integration tests for the policy and workload reconcilers
//!
//! The reconcilers read from the context's watch caches and write through
//! the gateway. Tests mirror the fake cluster into the caches before each
//! pass, standing in for the informers.

mod support;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_test::assert_ok;
use workload_backup_operator::controllers::Context;
use workload_backup_operator::crd::{BackupPolicy, BackupType};
use workload_backup_operator::error::Error;
use workload_backup_operator::queue::{Action, ObjectKey};
use workload_backup_operator::rbac::{self, grant_name};
use workload_backup_operator::reconcilers::{cronjob, policy as policy_reconciler, workload as workload_reconciler};
use workload_backup_operator::reconcilers::policy::{PHASE_INVALID, PHASE_READY};
use workload_backup_operator::sidecar::{has_sidecar, SIDECAR_NAME};
use workload_backup_operator::workload::{
    applied_policy, save_replicas, Workload, WorkloadKind, WorkloadRef, APPLIED_POLICY,
    PREVIOUS_REPLICA_COUNT, SCALED_DOWN_AT,
};

use support::*;

const DEMO: &[(&str, &str)] = &[("app", "demo")];

// ============================================================================
// Test Helpers
// ============================================================================

/// Run a policy pass and return the workloads it handed on
async fn policy_pass(ctx: &Context, cluster: &FakeCluster, name: &str) -> Vec<WorkloadRef> {
    sync_caches(ctx, cluster);
    let action = assert_ok!(policy_reconciler::reconcile(&ObjectKey::new(NAMESPACE, name), ctx).await);
    assert_eq!(action, Action::AwaitChange);
    drain_queue(&ctx.workload_queue).await
}

async fn workload_pass(ctx: &Context, cluster: &FakeCluster, target: &WorkloadRef) -> Action {
    sync_caches(ctx, cluster);
    assert_ok!(workload_reconciler::reconcile(target, ctx).await)
}

/// Policy pass followed by a pass over every workload it handed on
async fn settle(ctx: &Context, cluster: &FakeCluster, name: &str) {
    for target in policy_pass(ctx, cluster, name).await {
        workload_pass(ctx, cluster, &target).await;
    }
}

fn setup(policies: Vec<BackupPolicy>) -> (Arc<FakeCluster>, Context) {
    let cluster = Arc::new(FakeCluster::new());
    cluster.add_workload(deployment("web", DEMO, 3));
    cluster.add_workload(owned_replica_set("web-5d8f", "web", DEMO, 3));
    cluster.add_workload(deployment("api", &[("app", "other")], 2));
    for p in policies {
        cluster.add_policy(p);
    }
    let ctx = context(cluster.clone());
    (cluster, ctx)
}

fn injected_by(workload: &Workload, policy: &str) -> bool {
    has_sidecar(workload.pod_template())
        && applied_policy(workload)
            .unwrap()
            .is_some_and(|m| m.refers_to(NAMESPACE, policy))
}

fn web() -> WorkloadRef {
    key(WorkloadKind::Deployment, "web")
}

// ============================================================================
// Policy Reconciler Tests
// ============================================================================

#[tokio::test]
async fn policy_pass_enqueues_selected_workloads_only() {
    let (cluster, ctx) = setup(vec![policy("nightly", DEMO, BackupType::Online)]);

    let enqueued = policy_pass(&ctx, &cluster, "nightly").await;

    // The deployment-owned replica set is handled through its deployment.
    assert_eq!(enqueued, vec![web()]);
    let status = cluster.status(NAMESPACE, "nightly").unwrap();
    assert_eq!(status.phase.as_deref(), Some(PHASE_READY));
    assert_eq!(status.matched_workloads, Some(1));
    assert_eq!(status.observed_generation, Some(1));
}

#[tokio::test]
async fn invalid_policy_is_marked_and_touches_nothing() {
    let mut invalid = policy("nightly", DEMO, BackupType::Offline);
    invalid.spec.schedule = "every night".to_string();
    let (cluster, ctx) = setup(vec![invalid]);

    let enqueued = policy_pass(&ctx, &cluster, "nightly").await;

    assert!(enqueued.is_empty());
    let status = cluster.status(NAMESPACE, "nightly").unwrap();
    assert_eq!(status.phase.as_deref(), Some(PHASE_INVALID));
    assert!(status.message.unwrap().contains("schedule"));
    assert_eq!(status.conditions[0].status, "False");
    assert!(cluster.cron_job(NAMESPACE, &cronjob::job_name("nightly")).is_none());
    assert_eq!(cluster.workload_writes(), 0);
}

#[tokio::test]
async fn empty_selector_policy_is_invalid() {
    let (cluster, ctx) = setup(vec![policy("everything", &[], BackupType::Online)]);

    let enqueued = policy_pass(&ctx, &cluster, "everything").await;

    assert!(enqueued.is_empty());
    let status = cluster.status(NAMESPACE, "everything").unwrap();
    assert_eq!(status.phase.as_deref(), Some(PHASE_INVALID));
}

#[tokio::test]
async fn second_policy_pass_skips_up_to_date_workloads() {
    let (cluster, ctx) = setup(vec![policy("nightly", DEMO, BackupType::Online)]);
    settle(&ctx, &cluster, "nightly").await;

    let enqueued = policy_pass(&ctx, &cluster, "nightly").await;
    assert!(enqueued.is_empty());
    assert_eq!(cluster.status(NAMESPACE, "nightly").unwrap().matched_workloads, Some(1));
}

#[tokio::test]
async fn unchanged_ready_condition_keeps_its_transition_time() {
    let (cluster, ctx) = setup(vec![policy("nightly", DEMO, BackupType::Online)]);
    policy_pass(&ctx, &cluster, "nightly").await;
    let first = cluster.status(NAMESPACE, "nightly").unwrap().conditions[0].last_transition_time;

    tokio::time::sleep(Duration::from_millis(10)).await;
    policy_pass(&ctx, &cluster, "nightly").await;
    let status = cluster.status(NAMESPACE, "nightly").unwrap();
    assert_eq!(status.conditions[0].status, "True");
    assert_eq!(status.conditions[0].last_transition_time, first);

    let mut broken = policy("nightly", DEMO, BackupType::Online);
    broken.spec.schedule = "not a schedule".to_string();
    broken.status = Some(status);
    cluster.add_policy(broken);
    policy_pass(&ctx, &cluster, "nightly").await;

    let condition = &cluster.status(NAMESPACE, "nightly").unwrap().conditions[0];
    assert_eq!(condition.status, "False");
    assert!(condition.last_transition_time > first);
}

// ============================================================================
// Injection Tests
// ============================================================================

#[tokio::test]
async fn online_policy_injects_sidecar_and_grant() {
    let (cluster, ctx) = setup(vec![policy("nightly", DEMO, BackupType::Online)]);

    settle(&ctx, &cluster, "nightly").await;

    let workload = cluster.workload(&web());
    assert!(injected_by(&workload, "nightly"));
    let spec = workload.pod_template().unwrap().spec.as_ref().unwrap();
    assert!(spec.containers.iter().any(|c| c.name == SIDECAR_NAME));
    assert!(spec.containers.iter().any(|c| c.name == "app"));

    let binding = cluster
        .role_binding(NAMESPACE, &grant_name(WorkloadKind::Deployment, "web"))
        .unwrap();
    assert_eq!(binding.role_ref.kind, "ClusterRole");
    let subjects = binding.subjects.unwrap();
    assert_eq!(subjects[0].name, "default");
    let owners = binding.metadata.owner_references.unwrap();
    assert_eq!(owners[0].kind, "Deployment");
    assert_eq!(owners[0].name, "web");

    // Unselected workloads are left alone.
    assert!(!has_sidecar(
        cluster.workload(&key(WorkloadKind::Deployment, "api")).pod_template()
    ));
    assert!(!has_sidecar(
        cluster
            .workload(&key(WorkloadKind::ReplicaSet, "web-5d8f"))
            .pod_template()
    ));
}

#[tokio::test]
async fn repeated_workload_pass_writes_nothing() {
    let (cluster, ctx) = setup(vec![policy("nightly", DEMO, BackupType::Online)]);
    settle(&ctx, &cluster, "nightly").await;
    let writes = cluster.workload_writes();

    let action = workload_pass(&ctx, &cluster, &web()).await;

    assert_eq!(action, Action::AwaitChange);
    assert_eq!(cluster.workload_writes(), writes);
}

#[tokio::test]
async fn grant_follows_a_changed_service_account() {
    let (cluster, ctx) = setup(vec![policy("nightly", DEMO, BackupType::Online)]);
    settle(&ctx, &cluster, "nightly").await;
    let writes = cluster.workload_writes();

    let mut workload = cluster.workload(&web());
    workload
        .pod_template_mut()
        .spec
        .as_mut()
        .unwrap()
        .service_account_name = Some("web-sa".to_string());
    cluster.add_workload(workload);

    let action = workload_pass(&ctx, &cluster, &web()).await;

    assert_eq!(action, Action::AwaitChange);
    assert_eq!(cluster.workload_writes(), writes);
    let binding = cluster
        .role_binding(NAMESPACE, &grant_name(WorkloadKind::Deployment, "web"))
        .unwrap();
    assert_eq!(binding.subjects.unwrap()[0].name, "web-sa");
}

#[tokio::test]
async fn offline_policy_injects_init_container_and_schedules_scale_down() {
    let (cluster, ctx) = setup(vec![policy("nightly", DEMO, BackupType::Offline)]);

    settle(&ctx, &cluster, "nightly").await;

    let workload = cluster.workload(&web());
    let spec = workload.pod_template().unwrap().spec.as_ref().unwrap();
    assert!(spec
        .init_containers
        .as_ref()
        .unwrap()
        .iter()
        .any(|c| c.name == SIDECAR_NAME));
    assert!(!spec.containers.iter().any(|c| c.name == SIDECAR_NAME));

    let name = cronjob::job_name("nightly");
    let job = cluster.cron_job(NAMESPACE, &name).unwrap();
    let job_spec = job.spec.unwrap();
    assert_eq!(job_spec.schedule, "*/30 * * * *");
    assert_eq!(job_spec.concurrency_policy.as_deref(), Some("Forbid"));
    let pod_spec = job_spec.job_template.spec.unwrap().template.spec.unwrap();
    assert_eq!(pod_spec.service_account_name.as_deref(), Some(name.as_str()));
    let args = pod_spec.containers[0].args.clone().unwrap();
    assert_eq!(args[0], "scaledown");
    assert!(args.contains(&"--selector=app=demo".to_string()));
    assert!(args.contains(&format!("--namespace={}", NAMESPACE)));
    let owners = job.metadata.owner_references.unwrap();
    assert_eq!(owners[0].kind, "BackupPolicy");

    // The job runs under its own account, role and binding.
    assert!(cluster.service_account(NAMESPACE, &name).is_some());
    assert!(cluster.role(NAMESPACE, &name).is_some());
    let binding = cluster.role_binding(NAMESPACE, &name).unwrap();
    assert_eq!(binding.role_ref.kind, "Role");
    assert_eq!(
        binding.metadata.owner_references.unwrap()[0].kind,
        "CronJob"
    );
}

#[tokio::test]
async fn workload_rules_permit_the_gateway_write() {
    let (cluster, ctx) = setup(vec![policy("nightly", DEMO, BackupType::Offline)]);
    settle(&ctx, &cluster, "nightly").await;
    assert_ok!(rbac::ensure_sidecar_cluster_role(ctx.gateway.as_ref()).await);

    // Workloads are written back with a full replace, authorized as `update`.
    let job_role = cluster.role(NAMESPACE, &cronjob::job_name("nightly")).unwrap();
    let sidecar_role = cluster.cluster_role(rbac::SIDECAR_CLUSTER_ROLE).unwrap();
    for rules in [job_role.rules.unwrap(), sidecar_role.rules.unwrap()] {
        for resource in ["deployments", "replicasets", "replicationcontrollers"] {
            let rule = rules
                .iter()
                .find(|r| r.resources.iter().flatten().any(|x| x == resource))
                .unwrap();
            assert!(
                rule.verbs.iter().any(|v| v == "update"),
                "no update verb for {}",
                resource
            );
        }
    }
}

#[tokio::test]
async fn switching_to_online_moves_the_component_and_drops_the_job() {
    let (cluster, ctx) = setup(vec![policy("nightly", DEMO, BackupType::Offline)]);
    settle(&ctx, &cluster, "nightly").await;
    assert!(cluster.cron_job(NAMESPACE, &cronjob::job_name("nightly")).is_some());

    cluster.add_policy(policy("nightly", DEMO, BackupType::Online));
    settle(&ctx, &cluster, "nightly").await;

    assert!(cluster.cron_job(NAMESPACE, &cronjob::job_name("nightly")).is_none());
    let workload = cluster.workload(&web());
    let spec = workload.pod_template().unwrap().spec.as_ref().unwrap();
    assert!(spec.containers.iter().any(|c| c.name == SIDECAR_NAME));
    assert!(spec
        .init_containers
        .iter()
        .flatten()
        .all(|c| c.name != SIDECAR_NAME));
    let marker = applied_policy(&workload).unwrap().unwrap();
    assert_eq!(marker.spec.backup_type, BackupType::Online);
}

#[tokio::test]
async fn replica_set_pods_are_restarted_after_injection() {
    let (cluster, ctx) = setup(vec![policy("nightly", DEMO, BackupType::Online)]);
    cluster.add_workload(replica_set("batch", &[("app", "demo"), ("tier", "batch")], 2));
    cluster.add_pod(pod("batch-a", &[("app", "demo"), ("tier", "batch")], WorkloadKind::ReplicaSet, "batch"));
    cluster.add_pod(pod("batch-b", &[("app", "demo"), ("tier", "batch")], WorkloadKind::ReplicaSet, "batch"));
    cluster.add_pod(pod("web-1", DEMO, WorkloadKind::ReplicaSet, "web-5d8f"));

    settle(&ctx, &cluster, "nightly").await;

    assert!(injected_by(&cluster.workload(&key(WorkloadKind::ReplicaSet, "batch")), "nightly"));
    let mut deleted = cluster.deleted_pods();
    deleted.sort();
    assert_eq!(deleted, vec!["batch-a".to_string(), "batch-b".to_string()]);
    assert_eq!(cluster.pod_names(), vec!["web-1".to_string()]);
}

#[tokio::test]
async fn multiple_matching_policies_leave_the_workload_alone() {
    let (cluster, ctx) = setup(vec![
        policy("nightly", DEMO, BackupType::Online),
        policy("hourly", DEMO, BackupType::Online),
    ]);

    let action = workload_pass(&ctx, &cluster, &web()).await;

    assert_eq!(action, Action::AwaitChange);
    assert_eq!(cluster.workload_writes(), 0);
    assert!(cluster
        .role_binding(NAMESPACE, &grant_name(WorkloadKind::Deployment, "web"))
        .is_none());
}

#[tokio::test]
async fn policies_in_other_namespaces_do_not_apply() {
    let mut elsewhere = policy("nightly", DEMO, BackupType::Online);
    elsewhere.metadata.namespace = Some("staging".to_string());
    let (cluster, ctx) = setup(vec![elsewhere]);

    workload_pass(&ctx, &cluster, &web()).await;
    assert_eq!(cluster.workload_writes(), 0);
}

// ============================================================================
// Removal Tests
// ============================================================================

#[tokio::test]
async fn deleting_the_policy_removes_component_and_grant() {
    let (cluster, ctx) = setup(vec![policy("nightly", DEMO, BackupType::Online)]);
    let worker = key(WorkloadKind::Deployment, "worker");
    let api = key(WorkloadKind::Deployment, "api");
    cluster.add_workload(deployment("worker", DEMO, 1));
    settle(&ctx, &cluster, "nightly").await;
    assert!(injected_by(&cluster.workload(&web()), "nightly"));
    assert!(injected_by(&cluster.workload(&worker), "nightly"));
    let api_before = cluster.workload(&api);

    cluster.remove_policy(NAMESPACE, "nightly");
    let mut enqueued = policy_pass(&ctx, &cluster, "nightly").await;
    enqueued.sort();
    // Only workloads that carried this policy's component are revisited.
    assert_eq!(enqueued, vec![web(), worker.clone()]);

    for target in &enqueued {
        workload_pass(&ctx, &cluster, target).await;
    }

    for target in [web(), worker] {
        let workload = cluster.workload(&target);
        assert!(!has_sidecar(workload.pod_template()));
        assert_eq!(workload.annotation(APPLIED_POLICY), None);
        let spec = workload.pod_template().unwrap().spec.as_ref().unwrap();
        assert!(spec.volumes.is_none());
        assert!(cluster
            .role_binding(NAMESPACE, &grant_name(WorkloadKind::Deployment, &target.name))
            .is_none());
    }

    // The unselected deployment is exactly as it was.
    assert_eq!(cluster.workload(&api), api_before);
    assert!(cluster
        .role_binding(NAMESPACE, &grant_name(WorkloadKind::Deployment, "api"))
        .is_none());
}

#[tokio::test]
async fn releasing_one_long_named_workload_keeps_its_neighbours_grant() {
    let (cluster, ctx) = setup(vec![policy("nightly", DEMO, BackupType::Online)]);
    let blue = key(WorkloadKind::Deployment, "payments-reconciliation-service-frontend-blue");
    let green = key(WorkloadKind::Deployment, "payments-reconciliation-service-frontend-green");
    cluster.add_workload(deployment(&blue.name, DEMO, 1));
    cluster.add_workload(deployment(&green.name, DEMO, 1));
    settle(&ctx, &cluster, "nightly").await;

    let blue_grant = grant_name(WorkloadKind::Deployment, &blue.name);
    let green_grant = grant_name(WorkloadKind::Deployment, &green.name);
    assert_ne!(blue_grant, green_grant);
    assert!(cluster.role_binding(NAMESPACE, &blue_grant).is_some());
    assert!(cluster.role_binding(NAMESPACE, &green_grant).is_some());

    let mut relabelled = cluster.workload(&blue);
    relabelled
        .metadata_mut()
        .labels
        .as_mut()
        .unwrap()
        .insert("app".to_string(), "retired".to_string());
    cluster.add_workload(relabelled);
    settle(&ctx, &cluster, "nightly").await;

    assert!(!has_sidecar(cluster.workload(&blue).pod_template()));
    assert!(cluster.role_binding(NAMESPACE, &blue_grant).is_none());
    assert!(injected_by(&cluster.workload(&green), "nightly"));
    let binding = cluster.role_binding(NAMESPACE, &green_grant).unwrap();
    assert_eq!(binding.metadata.owner_references.unwrap()[0].name, green.name);
}

#[tokio::test]
async fn workload_that_stops_matching_is_released() {
    let (cluster, ctx) = setup(vec![policy("nightly", DEMO, BackupType::Online)]);
    settle(&ctx, &cluster, "nightly").await;

    let mut relabelled = cluster.workload(&web());
    relabelled
        .metadata_mut()
        .labels
        .as_mut()
        .unwrap()
        .insert("app".to_string(), "retired".to_string());
    cluster.add_workload(relabelled);

    let enqueued = policy_pass(&ctx, &cluster, "nightly").await;
    assert_eq!(enqueued, vec![web()]);
    assert_eq!(cluster.status(NAMESPACE, "nightly").unwrap().matched_workloads, Some(0));

    workload_pass(&ctx, &cluster, &web()).await;
    assert!(!has_sidecar(cluster.workload(&web()).pod_template()));
}

#[tokio::test]
async fn workload_of_policy_turned_invalid_is_left_untouched() {
    let (cluster, ctx) = setup(vec![policy("nightly", DEMO, BackupType::Online)]);
    settle(&ctx, &cluster, "nightly").await;
    let writes = cluster.workload_writes();

    let mut broken = policy("nightly", DEMO, BackupType::Online);
    broken.spec.schedule = "not a schedule".to_string();
    cluster.add_policy(broken);

    workload_pass(&ctx, &cluster, &web()).await;

    assert_eq!(cluster.workload_writes(), writes);
    assert!(injected_by(&cluster.workload(&web()), "nightly"));
}

#[tokio::test]
async fn malformed_marker_without_policy_is_cleaned_up() {
    let (cluster, ctx) = setup(vec![]);
    let mut workload = cluster.workload(&web());
    workload.set_annotation(APPLIED_POLICY, "{not json");
    cluster.add_workload(workload);

    let action = workload_pass(&ctx, &cluster, &web()).await;

    assert_eq!(action, Action::AwaitChange);
    assert_eq!(cluster.workload(&web()).annotation(APPLIED_POLICY), None);
}

// ============================================================================
// Restore Tests
// ============================================================================

fn scaled_down_web(at: chrono::DateTime<Utc>) -> Workload {
    let mut workload = deployment("web", DEMO, 3);
    save_replicas(&mut workload, at).unwrap();
    workload.set_replicas(0);
    workload
}

#[tokio::test]
async fn recent_scale_down_is_left_to_finish() {
    let (cluster, ctx) = setup(vec![]);
    cluster.add_workload(scaled_down_web(Utc::now()));

    let action = workload_pass(&ctx, &cluster, &web()).await;

    match action {
        Action::Requeue(after) => {
            assert!(after > Duration::ZERO);
            assert!(after <= ctx.restore_grace);
        }
        other => panic!("expected a requeue, got {:?}", other),
    }
    assert_eq!(cluster.workload(&web()).replicas(), Some(0));
}

#[tokio::test]
async fn stale_scale_down_is_restored() {
    let (cluster, ctx) = setup(vec![]);
    cluster.add_workload(scaled_down_web(Utc::now() - chrono::Duration::hours(1)));

    let action = workload_pass(&ctx, &cluster, &web()).await;

    assert_eq!(action, Action::AwaitChange);
    let workload = cluster.workload(&web());
    assert_eq!(workload.replicas(), Some(3));
    assert_eq!(workload.annotation(PREVIOUS_REPLICA_COUNT), None);
    assert_eq!(workload.annotation(SCALED_DOWN_AT), None);
}

#[tokio::test]
async fn saved_count_without_timestamp_is_restored() {
    let (cluster, ctx) = setup(vec![]);
    let mut workload = scaled_down_web(Utc::now());
    workload.remove_annotation(SCALED_DOWN_AT);
    cluster.add_workload(workload);

    workload_pass(&ctx, &cluster, &web()).await;
    assert_eq!(cluster.workload(&web()).replicas(), Some(3));
}

#[tokio::test]
async fn malformed_saved_count_fails_the_pass() {
    let (cluster, ctx) = setup(vec![]);
    let mut workload = deployment("web", DEMO, 0);
    workload.set_annotation(PREVIOUS_REPLICA_COUNT, "many");
    cluster.add_workload(workload);
    sync_caches(&ctx, &cluster);

    let result = workload_reconciler::reconcile(&web(), &ctx).await;

    assert!(matches!(result, Err(Error::InvalidAnnotation { .. })));
    assert_eq!(cluster.workload_writes(), 0);
}

// ============================================================================
// Skip Rules
// ============================================================================

#[tokio::test]
async fn deployment_owned_replica_set_is_skipped() {
    let (cluster, ctx) = setup(vec![policy("nightly", DEMO, BackupType::Online)]);

    let action = workload_pass(&ctx, &cluster, &key(WorkloadKind::ReplicaSet, "web-5d8f")).await;

    assert_eq!(action, Action::AwaitChange);
    assert_eq!(cluster.workload_writes(), 0);
}

#[tokio::test]
async fn vanished_workload_is_ignored() {
    let (cluster, ctx) = setup(vec![policy("nightly", DEMO, BackupType::Online)]);

    let action = workload_pass(&ctx, &cluster, &key(WorkloadKind::Deployment, "gone")).await;
    assert_eq!(action, Action::AwaitChange);
}

#[tokio::test]
async fn workload_deleted_before_the_write_is_not_an_error() {
    let (cluster, ctx) = setup(vec![policy("nightly", DEMO, BackupType::Online)]);
    sync_caches(&ctx, &cluster);
    // Cached but already gone from the cluster.
    ctx.workloads.insert(deployment("ghost", DEMO, 1));

    let action = assert_ok!(
        workload_reconciler::reconcile(&key(WorkloadKind::Deployment, "ghost"), &ctx).await
    );
    assert_eq!(action, Action::AwaitChange);
}
