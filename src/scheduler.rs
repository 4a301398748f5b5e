use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::driver::Deployment;
use crate::probe::{self, ProbeError};
use crate::runtime::{ContainerApi, ContainerSpec, MountSpec, PortSpec, RuntimeError};
use crate::stack::{StackDefinition, StackError, StackItem};

/* ============================= LABELS ============================= */

pub const LABEL_STACK: &str = "stack.tracedock.io/name";
pub const LABEL_ELEMENT: &str = "stack.tracedock.io/element";
pub const LABEL_POSITION: &str = "stack.tracedock.io/position";
pub const LABEL_VOLUMES: &str = "stack.tracedock.io/volumes";

/* ============================= ERRORS ============================= */

#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Stack(#[from] StackError),
    #[error("dependency not found: {0}")]
    DependencyNotFound(String),
    #[error("dependency wait failed for {name}: {source}")]
    DependencyWait {
        name: String,
        #[source]
        source: ProbeError,
    },
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("post-start action {name} exited with code {code}")]
    ActionFailed { name: String, code: i64 },
    #[error("post-start action {name} timed out after {timeout_sec}s")]
    ActionTimeout { name: String, timeout_sec: u64 },
}

/* ============================= OPTIONS ============================= */

/// How the driver wants containers named.
#[derive(Debug, Clone)]
pub enum NamingScheme {
    /// `{stack}-{element}`, stable production names.
    StackPrefixed,
    /// `{element}-{suffix}`, collision-free ephemeral names.
    Suffixed(String),
}

/// Driver-specific deployment knobs handed to the scheduler.
#[derive(Debug, Clone)]
pub struct DeployOptions {
    pub network: String,
    pub naming: NamingScheme,
    /// Use the stack's fixed host ports; false lets the runtime pick.
    pub fixed_host_ports: bool,
    pub restart_unless_stopped: bool,
    pub labels: HashMap<String, String>,
    /// Volume source renames (ephemeral runs suffix their volumes).
    pub volume_alias: HashMap<String, String>,
}

impl DeployOptions {
    pub fn container_name(&self, stack_name: &str, element_name: &str) -> String {
        match &self.naming {
            NamingScheme::StackPrefixed => format!("{stack_name}-{element_name}"),
            NamingScheme::Suffixed(suffix) => format!("{element_name}-{suffix}"),
        }
    }
}

/* ============================= SCHEDULER ============================= */

/// Start every element in position order. Each element waits on its
/// dependencies, is created and started, passes its own health check, then
/// runs its post-start actions. The first failure aborts; rollback policy
/// belongs to the driver.
pub async fn run_stack<A: ContainerApi + ?Sized>(
    api: &A,
    stack: &StackDefinition,
    options: &DeployOptions,
    deployment: &mut Deployment,
) -> Result<(), DeployError> {
    for element in stack.startup_order() {
        start_element(api, stack, element, options, deployment).await?;
    }
    Ok(())
}

async fn start_element<A: ContainerApi + ?Sized>(
    api: &A,
    stack: &StackDefinition,
    element: &StackItem,
    options: &DeployOptions,
    deployment: &mut Deployment,
) -> Result<(), DeployError> {
    // Every named dependency must already be deployed.
    for dependency in element.dependency_names() {
        if !deployment.containers.contains_key(&dependency) {
            return Err(DeployError::DependencyNotFound(dependency));
        }
    }

    // Health-gated dependencies block until their own check passes again;
    // plain presence satisfies the rest.
    for requirement in &element.software_requirements {
        if !requirement.wait_for_healthy {
            continue;
        }
        let dependency_id = deployment
            .containers
            .get(&requirement.name)
            .ok_or_else(|| DeployError::DependencyNotFound(requirement.name.clone()))?;
        let Some(dependency) = stack.element(&requirement.name) else {
            return Err(DeployError::DependencyNotFound(requirement.name.clone()));
        };
        if let Some(check) = &dependency.health_check {
            probe::wait_ready(api, &requirement.name, dependency_id, check)
                .await
                .map_err(|source| DeployError::DependencyWait {
                    name: requirement.name.clone(),
                    source,
                })?;
        }
    }

    let spec = container_spec(stack, element, options);
    let container_id = api.create_container(&spec).await?;
    api.start_container(&container_id).await?;
    info!(
        stack = %stack.name,
        element = %element.name,
        container = %container_id,
        "container_started"
    );
    deployment.containers.insert(element.name.clone(), container_id.clone());

    if !element.ports.is_empty() {
        let info = api.inspect_container(&container_id).await?;
        let first = element.ports[0].container_port;
        if let Some(host) = info.host_ports.get(&first) {
            deployment.host_ports.insert(element.name.clone(), *host);
        }
    }

    if let Some(check) = &element.health_check {
        probe::wait_ready(api, &element.name, &container_id, check).await?;
    }

    for action in &element.potential_action {
        let outcome = tokio::time::timeout(
            Duration::from_secs(action.timeout_sec),
            api.exec(&container_id, &action.command, action.working_directory.as_deref()),
        )
        .await;
        match outcome {
            Ok(Ok(result)) if result.success() => {
                info!(element = %element.name, action = %action.name, "post_start_action_completed");
            }
            Ok(Ok(result)) => {
                return Err(DeployError::ActionFailed {
                    name: action.name.clone(),
                    code: result.exit_code,
                });
            }
            Ok(Err(e)) => return Err(DeployError::Runtime(e)),
            Err(_) => {
                return Err(DeployError::ActionTimeout {
                    name: action.name.clone(),
                    timeout_sec: action.timeout_sec,
                });
            }
        }
    }

    Ok(())
}

/* ============================= SPEC BUILDING ============================= */

pub(crate) fn container_spec(
    stack: &StackDefinition,
    element: &StackItem,
    options: &DeployOptions,
) -> ContainerSpec {
    let env: Vec<String> = element
        .environment
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();

    let ports: Vec<PortSpec> = element
        .ports
        .iter()
        .map(|p| PortSpec {
            container_port: p.container_port,
            host_port: if options.fixed_host_ports { p.host_port } else { None },
            protocol: p.protocol,
        })
        .collect();

    let mounts: Vec<MountSpec> = element
        .volumes
        .iter()
        .map(|m| MountSpec {
            source: options
                .volume_alias
                .get(&m.source)
                .cloned()
                .unwrap_or_else(|| m.source.clone()),
            target: m.target.clone(),
            read_only: m.read_only,
            mount_type: m.mount_type,
        })
        .collect();

    let mut labels = options.labels.clone();
    labels.insert(LABEL_STACK.to_string(), stack.name.clone());
    labels.insert(LABEL_ELEMENT.to_string(), element.name.clone());
    labels.insert(LABEL_POSITION.to_string(), element.position.to_string());
    let volume_sources: Vec<&str> = mounts
        .iter()
        .filter(|m| m.mount_type == crate::stack::MountType::Volume)
        .map(|m| m.source.as_str())
        .collect();
    if !volume_sources.is_empty() {
        labels.insert(LABEL_VOLUMES.to_string(), volume_sources.join(","));
    }

    ContainerSpec {
        name: Some(options.container_name(&stack.name, &element.name)),
        image: element.image.clone(),
        command: element.command.clone(),
        env,
        ports,
        mounts,
        network: Some(options.network.clone()),
        restart_unless_stopped: options.restart_unless_stopped,
        labels,
    }
}
