use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::runtime::ContainerApi;
use crate::scheduler::{
    self, DeployError, DeployOptions, NamingScheme, LABEL_POSITION, LABEL_STACK, LABEL_VOLUMES,
};
use crate::stack::StackDefinition;

/* ============================= DEPLOYMENT RECORD ============================= */

/// What a deployment produced: container ids, bound host ports, network and
/// volume handles, keyed by element/volume name.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub stack_name: String,
    pub containers: BTreeMap<String, String>,
    pub host_ports: BTreeMap<String, u16>,
    pub network_id: Option<String>,
    pub volumes: BTreeMap<String, String>,
    pub start_time: DateTime<Utc>,
}

impl Deployment {
    pub fn new(stack_name: &str) -> Self {
        Self {
            stack_name: stack_name.to_string(),
            containers: BTreeMap::new(),
            host_ports: BTreeMap::new(),
            network_id: None,
            volumes: BTreeMap::new(),
            start_time: Utc::now(),
        }
    }
}

const STOP_GRACE: Duration = Duration::from_secs(30);

/* ============================= TEST DRIVER ============================= */

/// Ephemeral deployments for integration tests: time-suffixed network,
/// suffixed container and volume names, runtime-assigned host ports, and a
/// cleanup handle that is safe to call even after a failed setup.
pub struct TestDriver<A: ContainerApi + ?Sized> {
    api: Arc<A>,
}

/// A live test deployment plus everything cleanup needs.
pub struct TestDeployment<A: ContainerApi + ?Sized> {
    pub deployment: Deployment,
    api: Arc<A>,
    network_name: String,
    volume_names: Vec<String>,
}

impl<A: ContainerApi + ?Sized> TestDriver<A> {
    pub fn new(api: Arc<A>) -> Self {
        Self { api }
    }

    pub async fn deploy(
        &self,
        stack: &StackDefinition,
    ) -> Result<TestDeployment<A>, DeployError> {
        stack.validate()?;

        let suffix = format!(
            "{}-{}",
            Utc::now().timestamp_millis(),
            &Uuid::new_v4().simple().to_string()[..6]
        );
        let network_name = format!("{}-{}", stack.name, suffix);

        let mut deployment = Deployment::new(&stack.name);
        let mut volume_names = Vec::new();

        let result = self
            .deploy_inner(stack, &network_name, &suffix, &mut deployment, &mut volume_names)
            .await;

        match result {
            Ok(()) => Ok(TestDeployment {
                deployment,
                api: self.api.clone(),
                network_name,
                volume_names,
            }),
            Err(e) => {
                teardown(self.api.as_ref(), &deployment, &network_name, &volume_names).await;
                Err(e)
            }
        }
    }

    async fn deploy_inner(
        &self,
        stack: &StackDefinition,
        network_name: &str,
        suffix: &str,
        deployment: &mut Deployment,
        volume_names: &mut Vec<String>,
    ) -> Result<(), DeployError> {
        let network_id = self
            .api
            .create_network(network_name, &stack.network.driver)
            .await?;
        deployment.network_id = Some(network_id);

        let mut volume_alias = HashMap::new();
        for volume in &stack.volumes {
            let name = format!("{}-{}", volume.name, suffix);
            let id = self.api.create_volume(&name, &volume.driver).await?;
            volume_alias.insert(volume.name.clone(), name.clone());
            volume_names.push(name);
            deployment.volumes.insert(volume.name.clone(), id);
        }

        let options = DeployOptions {
            network: network_name.to_string(),
            naming: NamingScheme::Suffixed(suffix.to_string()),
            fixed_host_ports: false,
            restart_unless_stopped: false,
            labels: HashMap::new(),
            volume_alias,
        };

        scheduler::run_stack(self.api.as_ref(), stack, &options, deployment).await
    }
}

impl<A: ContainerApi + ?Sized> TestDeployment<A> {
    /// Bound host port for an element's first container port.
    pub fn host_port(&self, element: &str) -> Option<u16> {
        self.deployment.host_ports.get(element).copied()
    }

    /// Terminate every started container and remove the network and volumes.
    /// Safe to call repeatedly; errors are logged, not surfaced.
    pub async fn cleanup(&self) {
        teardown(
            self.api.as_ref(),
            &self.deployment,
            &self.network_name,
            &self.volume_names,
        )
        .await;
    }
}

async fn teardown<A: ContainerApi + ?Sized>(
    api: &A,
    deployment: &Deployment,
    network_name: &str,
    volume_names: &[String],
) {
    for (element, container_id) in deployment.containers.iter().rev() {
        if let Err(e) = api.remove_container(container_id, true).await {
            warn!(element = %element, error = %e, "cleanup_container_remove_failed");
        }
    }
    if deployment.network_id.is_some() {
        if let Err(e) = api.remove_network(network_name).await {
            warn!(network = %network_name, error = %e, "cleanup_network_remove_failed");
        }
    }
    for volume in volume_names {
        if let Err(e) = api.remove_volume(volume).await {
            warn!(volume = %volume, error = %e, "cleanup_volume_remove_failed");
        }
    }
    info!(stack = %deployment.stack_name, "test_deployment_cleaned_up");
}

/* ============================= PRODUCTION DRIVER ============================= */

/// Persistent deployments: `{stack}-{element}` container names, the stack's
/// fixed host ports, `unless-stopped` restart policy, on-demand network and
/// volume creation. Failure leaves partial state for the operator; there is
/// no implicit rollback.
pub struct ProdDriver<A: ContainerApi + ?Sized> {
    api: Arc<A>,
}

impl<A: ContainerApi + ?Sized> ProdDriver<A> {
    pub fn new(api: Arc<A>) -> Self {
        Self { api }
    }

    pub async fn deploy(&self, stack: &StackDefinition) -> Result<Deployment, DeployError> {
        stack.validate()?;

        let mut deployment = Deployment::new(&stack.name);

        if stack.network.create_if_not_exists
            && !self.api.network_exists(&stack.network.name).await?
        {
            let id = self
                .api
                .create_network(&stack.network.name, &stack.network.driver)
                .await?;
            deployment.network_id = Some(id);
        } else {
            deployment.network_id = Some(stack.network.name.clone());
        }

        for volume in &stack.volumes {
            if volume.create_if_not_exists && !self.api.volume_exists(&volume.name).await? {
                let id = self.api.create_volume(&volume.name, &volume.driver).await?;
                deployment.volumes.insert(volume.name.clone(), id);
            } else {
                deployment.volumes.insert(volume.name.clone(), volume.name.clone());
            }
        }

        let options = DeployOptions {
            network: stack.network.name.clone(),
            naming: NamingScheme::StackPrefixed,
            fixed_host_ports: true,
            restart_unless_stopped: true,
            labels: HashMap::new(),
            volume_alias: HashMap::new(),
        };

        scheduler::run_stack(self.api.as_ref(), stack, &options, &mut deployment).await?;
        info!(stack = %stack.name, containers = deployment.containers.len(), "stack_deployed");
        Ok(deployment)
    }

    /// Stop a deployed stack's containers in reverse position order with a
    /// 30-second graceful timeout each.
    pub async fn stop_stack(&self, stack_name: &str) -> Result<(), DeployError> {
        let mut containers = self.api.list_containers(LABEL_STACK, stack_name).await?;
        containers.sort_by_key(|c| {
            std::cmp::Reverse(
                c.labels
                    .get(LABEL_POSITION)
                    .and_then(|p| p.parse::<u32>().ok())
                    .unwrap_or(0),
            )
        });

        for container in containers {
            self.api.stop_container(&container.id, STOP_GRACE).await?;
            info!(container = %container.name, "container_stopped");
        }
        Ok(())
    }

    /// Force-remove a stack's containers. Volumes go only on explicit
    /// opt-in; the network is always preserved.
    pub async fn remove_stack(
        &self,
        stack_name: &str,
        remove_volumes: bool,
    ) -> Result<(), DeployError> {
        let containers = self.api.list_containers(LABEL_STACK, stack_name).await?;

        let mut volume_names: Vec<String> = Vec::new();
        for container in &containers {
            if let Some(csv) = container.labels.get(LABEL_VOLUMES) {
                for name in csv.split(',').filter(|s| !s.is_empty()) {
                    if !volume_names.iter().any(|v| v == name) {
                        volume_names.push(name.to_string());
                    }
                }
            }
        }

        for container in containers {
            self.api.remove_container(&container.id, true).await?;
            info!(container = %container.name, "container_removed");
        }

        if remove_volumes {
            for volume in volume_names {
                self.api.remove_volume(&volume).await?;
                info!(volume = %volume, "volume_removed");
            }
        }
        Ok(())
    }
}
