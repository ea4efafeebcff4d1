//! Nomad job descriptors for deployed bundles.
//!
//! The types mirror the subset of the Nomad job JSON API we submit: PascalCase keys,
//! durations as integer nanoseconds. [`build_job`] is pure; the same inputs always
//! produce an identical descriptor, and the job identity depends on the slug only so
//! resubmitting for a slug updates the running service instead of adding another.
use std::{collections::BTreeMap, time::Duration};
use serde::{Deserialize, Serialize};
use crate::{config::JobTemplate, error::PipelineError, models::validate_slug};

pub const JOB_PREFIX: &str = "loomapp";
pub const WEB_PORT_LABEL: &str = "web";
/// Port the gateway listens on inside the container.
pub const WEB_CONTAINER_PORT: u16 = 8081;

pub const RESTART_ATTEMPTS: u32 = 10;
pub const RESTART_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const RESTART_DELAY: Duration = Duration::from_secs(25);
pub const RESTART_MODE: &str = "delay";

pub const CHECK_INTERVAL: Duration = Duration::from_secs(10);
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(2);

const CPU_MHZ: u32 = 500;
const MEMORY_MB: u32 = 500;
const NETWORK_MBITS: u32 = 10;

/// Registration payload for `POST /v1/jobs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobRegisterRequest { pub job: Job }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Job {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub datacenters: Vec<String>,
    #[serde(rename = "Type")]
    pub job_type: String,
    pub update: UpdateStrategy,
    pub task_groups: Vec<TaskGroup>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateStrategy { pub max_parallel: u32 }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskGroup {
    pub name: String,
    pub count: u32,
    pub restart_policy: RestartPolicy,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RestartPolicy {
    #[serde(with = "nanos")]
    pub interval: Duration,
    pub attempts: u32,
    #[serde(with = "nanos")]
    pub delay: Duration,
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Task {
    pub name: String,
    pub driver: String,
    pub config: DockerConfig,
    pub env: BTreeMap<String, String>,
    pub resources: Resources,
    pub services: Vec<Service>,
}

/// Docker driver config; Nomad keeps driver config keys in snake_case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerConfig {
    pub image: String,
    pub port_map: Vec<BTreeMap<String, u16>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(rename = "CPU")]
    pub cpu: u32,
    #[serde(rename = "MemoryMB")]
    pub memory_mb: u32,
    #[serde(rename = "Networks")]
    pub networks: Vec<NetworkResource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkResource {
    #[serde(rename = "MBits")]
    pub mbits: u32,
    pub dynamic_ports: Vec<Port>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Port { pub label: String }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Service {
    pub name: String,
    pub tags: Vec<String>,
    pub port_label: String,
    pub checks: Vec<ServiceCheck>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceCheck {
    pub name: String,
    #[serde(rename = "Type")]
    pub check_type: String,
    #[serde(with = "nanos")]
    pub interval: Duration,
    #[serde(with = "nanos")]
    pub timeout: Duration,
}

/// Job ID (and name) for an application slug.
pub fn job_name(slug: &str) -> String { format!("{JOB_PREFIX}-{slug}") }

/// Traefik frontend rule routing `<slug>.<base_domain>` to the service.
pub fn routing_rule(slug: &str, base_domain: &str) -> String { format!("Host:{slug}.{base_domain}") }

/// Build the descriptor for deploying `artifact_name` as the service of `slug`.
pub fn build_job(slug: &str, artifact_name: &str, template: &JobTemplate) -> Result<Job, PipelineError> {
    if !validate_slug(slug) {
        return Err(PipelineError::InvalidArgument(format!("slug {slug:?} is not a normalized dns label")));
    }
    debug_assert!(!artifact_name.is_empty() && !artifact_name.contains('/'), "artifact name {artifact_name:?} is not a plain object name");
    let name = job_name(slug);

    let mut env = BTreeMap::new();
    env.insert("APP_ZIP_FILE".to_string(), format!("{}://{}/{}", template.artifact_scheme, template.artifact_prefix, artifact_name));
    env.insert("SPAWN_NETWORK".to_string(), "node /src/build/cli.node.js".to_string());
    env.insert("DEMO_MODE".to_string(), "false".to_string());
    env.insert("PRIVATE_KEY_JSON_PATH".to_string(), "data.json".to_string());

    let task = Task {
        name: name.clone(),
        driver: "docker".into(),
        config: DockerConfig {
            image: template.image.clone(),
            port_map: vec![BTreeMap::from([(WEB_PORT_LABEL.to_string(), WEB_CONTAINER_PORT)])],
        },
        env,
        resources: Resources {
            cpu: CPU_MHZ,
            memory_mb: MEMORY_MB,
            networks: vec![NetworkResource { mbits: NETWORK_MBITS, dynamic_ports: vec![Port { label: WEB_PORT_LABEL.into() }] }],
        },
        services: vec![Service {
            name: format!("{name}-check"),
            tags: vec![
                "global".into(),
                format!("traefik.tags={JOB_PREFIX}"),
                format!("traefik.frontend.rule={}", routing_rule(slug, &template.base_domain)),
            ],
            port_label: WEB_PORT_LABEL.into(),
            checks: vec![ServiceCheck { name: "alive".into(), check_type: "tcp".into(), interval: CHECK_INTERVAL, timeout: CHECK_TIMEOUT }],
        }],
    };

    Ok(Job {
        id: name.clone(),
        name: name.clone(),
        datacenters: template.datacenters.clone(),
        job_type: "service".into(),
        update: UpdateStrategy { max_parallel: 1 },
        task_groups: vec![TaskGroup {
            name,
            count: 1,
            restart_policy: RestartPolicy { interval: RESTART_INTERVAL, attempts: RESTART_ATTEMPTS, delay: RESTART_DELAY, mode: RESTART_MODE.into() },
            tasks: vec![task],
        }],
    })
}

mod nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        let n = u64::try_from(d.as_nanos()).map_err(serde::ser::Error::custom)?;
        s.serialize_u64(n)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_nanos)
    }
}
