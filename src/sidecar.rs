//! Backup component injected into workload pod templates

use k8s_openapi::api::core::v1::{
    Container, DownwardAPIVolumeFile, DownwardAPIVolumeSource, EmptyDirVolumeSource, EnvVar,
    EnvVarSource, ObjectFieldSelector, PodTemplateSpec, Volume, VolumeMount,
};

use crate::crd::{BackupPolicy, BackupType};
use crate::workload::WorkloadKind;

/// Name of the injected container, in either the container or init-container list
pub const SIDECAR_NAME: &str = "backup-sidecar";

pub const SCRATCH_VOLUME: &str = "backup-scratchdir";
pub const SCRATCH_MOUNT_PATH: &str = "/tmp/backup";

pub const PODINFO_VOLUME: &str = "backup-podinfo";
pub const PODINFO_MOUNT_PATH: &str = "/etc/backup/podinfo";

/// Settings for the injected component
#[derive(Clone, Debug)]
pub struct SidecarConfig {
    pub image: String,
}

impl SidecarConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
        }
    }

    fn container(&self, policy: &BackupPolicy, kind: WorkloadKind, workload: &str) -> Container {
        let namespace = policy.metadata.namespace.clone().unwrap_or_default();
        let mut args = vec![
            "backup".to_string(),
            format!("--policy-name={}", policy.metadata.name.as_deref().unwrap_or_default()),
            format!("--namespace={}", namespace),
            format!("--workload-kind={}", kind),
            format!("--workload-name={}", workload),
        ];
        if policy.spec.backup_type == BackupType::Offline {
            args.push("--offline".to_string());
        }

        Container {
            name: SIDECAR_NAME.to_string(),
            image: Some(self.image.clone()),
            args: Some(args),
            env: Some(vec![
                field_env("NODE_NAME", "spec.nodeName"),
                field_env("POD_NAME", "metadata.name"),
            ]),
            volume_mounts: Some(vec![
                VolumeMount {
                    name: SCRATCH_VOLUME.to_string(),
                    mount_path: SCRATCH_MOUNT_PATH.to_string(),
                    ..Default::default()
                },
                VolumeMount {
                    name: PODINFO_VOLUME.to_string(),
                    mount_path: PODINFO_MOUNT_PATH.to_string(),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }
    }

    /// Insert the backup component for `policy`: a sidecar container for
    /// online policies, an init-container for offline ones. Any copy in the
    /// other list is removed so switching type moves the component.
    pub fn inject(
        &self,
        template: &mut PodTemplateSpec,
        policy: &BackupPolicy,
        kind: WorkloadKind,
        workload: &str,
    ) {
        let container = self.container(policy, kind, workload);
        let spec = template.spec.get_or_insert_with(Default::default);

        match policy.spec.backup_type {
            BackupType::Online => {
                remove_named(spec.init_containers.as_mut());
                upsert_container(&mut spec.containers, container);
            }
            BackupType::Offline => {
                spec.containers.retain(|c| c.name != SIDECAR_NAME);
                upsert_container(spec.init_containers.get_or_insert_with(Vec::new), container);
            }
        }

        let volumes = spec.volumes.get_or_insert_with(Vec::new);
        upsert_volume(
            volumes,
            Volume {
                name: SCRATCH_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
        );
        upsert_volume(
            volumes,
            Volume {
                name: PODINFO_VOLUME.to_string(),
                downward_api: Some(DownwardAPIVolumeSource {
                    items: Some(vec![DownwardAPIVolumeFile {
                        path: "labels".to_string(),
                        field_ref: Some(ObjectFieldSelector {
                            field_path: "metadata.labels".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
    }
}

/// Strip the backup component and its volumes from a pod template
pub fn remove(template: &mut PodTemplateSpec) {
    let Some(spec) = template.spec.as_mut() else {
        return;
    };
    spec.containers.retain(|c| c.name != SIDECAR_NAME);
    remove_named(spec.init_containers.as_mut());
    if spec.init_containers.as_ref().is_some_and(Vec::is_empty) {
        spec.init_containers = None;
    }
    if let Some(volumes) = spec.volumes.as_mut() {
        volumes.retain(|v| v.name != SCRATCH_VOLUME && v.name != PODINFO_VOLUME);
        if volumes.is_empty() {
            spec.volumes = None;
        }
    }
}

/// Whether the template carries the backup component in either list
pub fn has_sidecar(template: Option<&PodTemplateSpec>) -> bool {
    template
        .and_then(|t| t.spec.as_ref())
        .map(|spec| {
            spec.containers.iter().any(|c| c.name == SIDECAR_NAME)
                || spec
                    .init_containers
                    .iter()
                    .flatten()
                    .any(|c| c.name == SIDECAR_NAME)
        })
        .unwrap_or(false)
}

fn remove_named(containers: Option<&mut Vec<Container>>) {
    if let Some(list) = containers {
        list.retain(|c| c.name != SIDECAR_NAME);
    }
}

fn upsert_container(containers: &mut Vec<Container>, container: Container) {
    match containers.iter_mut().find(|c| c.name == container.name) {
        Some(existing) => *existing = container,
        None => containers.push(container),
    }
}

fn upsert_volume(volumes: &mut Vec<Volume>, volume: Volume) {
    match volumes.iter_mut().find(|v| v.name == volume.name) {
        Some(existing) => *existing = volume,
        None => volumes.push(volume),
    }
}

fn field_env(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
