//! Pod template pipeline shared by apps, jobs and crons
//!
//! CPU is requested but never limited; memory is both requested and limited.

use std::collections::BTreeMap;

use keel_common::naming::{merge_labels, node_labels};
use serde::{Deserialize, Serialize};

use crate::k8s::{
    Container, EnvFromSource, EnvVar, PodMeta, PodSpec, PodTemplateSpec, ResourceQuantity,
    ResourceRequirements,
};
use crate::spot::SpotScheduling;

/// CPU and memory for a container
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    /// CPU request (e.g. `250m`)
    pub cpu: Option<String>,
    /// Memory request and limit (e.g. `512Mi`)
    pub memory: Option<String>,
}

impl Resources {
    /// Requests for CPU and memory, limit for memory only
    pub fn to_requirements(&self) -> Option<ResourceRequirements> {
        if self.cpu.is_none() && self.memory.is_none() {
            return None;
        }
        Some(ResourceRequirements {
            requests: Some(ResourceQuantity {
                cpu: self.cpu.clone(),
                memory: self.memory.clone(),
            }),
            limits: self.memory.as_ref().map(|memory| ResourceQuantity {
                cpu: None,
                memory: Some(memory.clone()),
            }),
        })
    }
}

/// Container definition shared by every workload type
#[derive(Clone, Debug, Default)]
pub struct ContainerOptions {
    /// Image
    pub image: String,
    /// Command override
    pub command: Option<Vec<String>>,
    /// Args
    pub args: Option<Vec<String>>,
    /// Literal env vars
    pub env: BTreeMap<String, String>,
    /// Secrets loaded whole as env vars
    pub env_from_secrets: Vec<String>,
    /// Resources
    pub resources: Resources,
}

impl ContainerOptions {
    /// Build the container spec
    pub fn to_container(&self, name: &str) -> Container {
        Container {
            name: name.to_string(),
            image: self.image.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            env: self
                .env
                .iter()
                .map(|(k, v)| EnvVar::literal(k, v))
                .collect(),
            env_from: self
                .env_from_secrets
                .iter()
                .map(EnvFromSource::secret)
                .collect(),
            resources: self.resources.to_requirements(),
            ..Default::default()
        }
    }
}

/// Pod-level settings
#[derive(Clone, Debug, Default)]
pub struct PodOptions {
    /// Labels in addition to the name label
    pub labels: BTreeMap<String, String>,
    /// Pod annotations (checksums)
    pub annotations: BTreeMap<String, String>,
    /// KSA name
    pub service_account: Option<String>,
    /// Spot scheduling
    pub spot: SpotScheduling,
    /// GKE node pool
    pub node_pool: Option<String>,
}

/// Assemble a pod template around the given containers
pub fn pod_template(name: &str, pod: &PodOptions, containers: Vec<Container>) -> PodTemplateSpec {
    let name_label = BTreeMap::from([(keel_common::LABEL_NAME.to_string(), name.to_string())]);
    PodTemplateSpec {
        metadata: PodMeta {
            labels: merge_labels([&pod.labels, &name_label]),
            annotations: pod.annotations.clone(),
        },
        spec: PodSpec {
            service_account_name: pod.service_account.clone(),
            containers,
            affinity: pod.spot.affinity.clone(),
            tolerations: pod.spot.tolerations.clone(),
            node_selector: pod
                .node_pool
                .as_deref()
                .map(node_labels)
                .unwrap_or_default(),
            ..Default::default()
        },
    }
}
