//! Scheduled scale-down job for offline policies

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use crate::controllers::Context;
use crate::crd::BackupPolicy;
use crate::error::{Error, Result};
use crate::rbac;
use crate::scale::ScaleTiming;
use crate::selector::Selector;

pub const POLICY_LABEL: &str = "backup.oso.sh/policy";
pub const OPERATION_LABEL: &str = "backup.oso.sh/operation";
pub const OPERATION_SCALE_DOWN: &str = "scale-down";

/// Cron job names are limited to 52 characters
const MAX_CRON_JOB_NAME: usize = 52;

/// Name of the scale-down job of a policy
pub fn job_name(policy: &str) -> String {
    rbac::bounded_name(&format!("scaledown-{}", policy), MAX_CRON_JOB_NAME)
}

/// Build the scale-down job for `policy`
pub fn build(
    policy: &BackupPolicy,
    selector: &Selector,
    image: &str,
    timing: ScaleTiming,
) -> Result<CronJob> {
    let owner = policy
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;
    let namespace = policy
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = job_name(&policy.name_any());

    let labels = BTreeMap::from([
        (POLICY_LABEL.to_string(), policy.name_any()),
        (OPERATION_LABEL.to_string(), OPERATION_SCALE_DOWN.to_string()),
    ]);

    Ok(CronJob {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(CronJobSpec {
            schedule: policy.spec.schedule.clone(),
            concurrency_policy: Some("Forbid".to_string()),
            job_template: JobTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(JobSpec {
                    template: PodTemplateSpec {
                        metadata: None,
                        spec: Some(PodSpec {
                            containers: vec![Container {
                                name: "scaledown".to_string(),
                                image: Some(image.to_string()),
                                args: Some(vec![
                                    "scaledown".to_string(),
                                    format!("--selector={}", selector),
                                    format!("--namespace={}", namespace),
                                    format!(
                                        "--drain-interval-secs={}",
                                        timing.drain_interval.as_secs()
                                    ),
                                    format!(
                                        "--drain-timeout-secs={}",
                                        timing.drain_timeout.as_secs()
                                    ),
                                ]),
                                ..Default::default()
                            }],
                            image_pull_secrets: policy.spec.image_pull_secrets.clone(),
                            restart_policy: Some("Never".to_string()),
                            service_account_name: Some(name),
                            ..Default::default()
                        }),
                    },
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

/// Create or update the scale-down job of an offline policy, with the RBAC
/// it runs under
pub async fn ensure(ctx: &Context, policy: &BackupPolicy, selector: &Selector) -> Result<()> {
    let desired = build(policy, selector, &ctx.operator_image, ctx.scale_timing)?;
    let applied = ctx.gateway.apply_cron_job(&desired).await?;

    let owner = applied
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;
    let namespace = applied.namespace().unwrap_or_default();
    let name = applied.name_any();
    rbac::ensure_scaledown_job_rbac(ctx.gateway.as_ref(), &owner, &namespace, &name).await?;

    debug!(namespace = %namespace, job = %name, "Ensured scale-down job");
    Ok(())
}

/// Remove the scale-down job of a policy that is no longer offline
pub async fn remove(ctx: &Context, policy: &BackupPolicy) -> Result<()> {
    let namespace = policy.namespace().unwrap_or_default();
    let name = job_name(&policy.name_any());
    if ctx.gateway.delete_cron_job(&namespace, &name).await? {
        info!(namespace = %namespace, job = %name, "Deleted scale-down job");
    }
    Ok(())
}
