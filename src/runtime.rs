use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;

use crate::stack::{MountType, Protocol};

/* ============================= ERRORS ============================= */

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container api: {0}")]
    Api(String),
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("exec failed: {0}")]
    Exec(String),
}

/* ============================= TYPES ============================= */

/// What the orchestrator asks the runtime to create. Deliberately smaller
/// than any SDK's container config; drivers translate it.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: Option<String>,
    pub image: String,
    pub command: Option<Vec<String>>,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    pub ports: Vec<PortSpec>,
    pub mounts: Vec<MountSpec>,
    pub network: Option<String>,
    pub restart_unless_stopped: bool,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct PortSpec {
    pub container_port: u16,
    /// None lets the runtime pick a free host port.
    pub host_port: Option<u16>,
    pub protocol: Protocol,
}

#[derive(Debug, Clone)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    pub read_only: bool,
    pub mount_type: MountType,
}

#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub running: bool,
    /// container port → host port, as actually bound.
    pub host_ports: HashMap<u16, u16>,
}

#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i64,
    pub output: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/* ============================= CAPABILITY TRAIT ============================= */

/// The container operations the orchestrator actually uses. The concrete
/// client (Docker socket, remote daemon, in-memory fake) is injected.
#[async_trait]
pub trait ContainerApi: Send + Sync {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;
    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;
    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError>;
    async fn list_containers(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<ContainerSummary>, RuntimeError>;
    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, RuntimeError>;
    async fn exec(
        &self,
        id: &str,
        command: &[String],
        working_dir: Option<&str>,
    ) -> Result<ExecResult, RuntimeError>;

    async fn create_network(&self, name: &str, driver: &str) -> Result<String, RuntimeError>;
    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError>;
    async fn network_exists(&self, name: &str) -> Result<bool, RuntimeError>;
    async fn create_volume(&self, name: &str, driver: &str) -> Result<String, RuntimeError>;
    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError>;
    async fn volume_exists(&self, name: &str) -> Result<bool, RuntimeError>;
}

/* ============================= DOCKER DRIVER ============================= */

/// `ContainerApi` over a local Docker daemon via bollard.
pub struct DockerApi {
    docker: bollard::Docker,
}

fn api_err<E: std::fmt::Display>(e: E) -> RuntimeError {
    RuntimeError::Api(e.to_string())
}

impl DockerApi {
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = bollard::Docker::connect_with_local_defaults().map_err(api_err)?;
        Ok(Self { docker })
    }

    pub async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await.map_err(api_err)?;
        Ok(())
    }
}

fn port_key(port: u16, protocol: Protocol) -> String {
    format!("{}/{}", port, protocol.as_str())
}

#[async_trait]
impl ContainerApi for DockerApi {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        use bollard::container::{Config, CreateContainerOptions};
        use bollard::models::{
            HostConfig, Mount, MountTypeEnum, PortBinding, RestartPolicy, RestartPolicyNameEnum,
        };

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for port in &spec.ports {
            let key = port_key(port.container_port, port.protocol);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: port.host_port.map(|p| p.to_string()),
                }]),
            );
        }

        let mounts: Vec<Mount> = spec
            .mounts
            .iter()
            .map(|m| Mount {
                source: Some(m.source.clone()),
                target: Some(m.target.clone()),
                read_only: Some(m.read_only),
                typ: Some(match m.mount_type {
                    MountType::Volume => MountTypeEnum::VOLUME,
                    MountType::Bind => MountTypeEnum::BIND,
                    MountType::Tmpfs => MountTypeEnum::TMPFS,
                }),
                ..Default::default()
            })
            .collect();

        let host_config = HostConfig {
            port_bindings: if port_bindings.is_empty() { None } else { Some(port_bindings) },
            mounts: if mounts.is_empty() { None } else { Some(mounts) },
            network_mode: spec.network.clone(),
            restart_policy: spec.restart_unless_stopped.then(|| RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: spec.command.clone(),
            env: if spec.env.is_empty() { None } else { Some(spec.env.clone()) },
            labels: if spec.labels.is_empty() { None } else { Some(spec.labels.clone()) },
            exposed_ports: if exposed_ports.is_empty() { None } else { Some(exposed_ports) },
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = spec
            .name
            .as_ref()
            .map(|name| CreateContainerOptions { name: name.clone(), platform: None });

        let created = self
            .docker
            .create_container(options, config)
            .await
            .map_err(api_err)?;
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container::<String>(id, None)
            .await
            .map_err(api_err)
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        use bollard::container::StopContainerOptions;
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: grace.as_secs() as i64 }))
            .await
            .map_err(api_err)
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        use bollard::container::RemoveContainerOptions;
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions { force, ..Default::default() }),
            )
            .await
            .map_err(api_err)
    }

    async fn list_containers(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        use bollard::container::ListContainersOptions;

        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{label}={value}")]);

        let listed = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(api_err)?;

        Ok(listed
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .unwrap_or_default()
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
        let inspected = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(api_err)?;

        let running = inspected
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);

        let mut host_ports = HashMap::new();
        if let Some(ports) = inspected.network_settings.and_then(|n| n.ports) {
            for (key, bindings) in ports {
                let container_port: u16 = match key.split('/').next().and_then(|p| p.parse().ok()) {
                    Some(port) => port,
                    None => continue,
                };
                let host_port = bindings
                    .unwrap_or_default()
                    .into_iter()
                    .find_map(|b| b.host_port.and_then(|p| p.parse().ok()));
                if let Some(host_port) = host_port {
                    host_ports.insert(container_port, host_port);
                }
            }
        }

        Ok(ContainerInfo {
            id: inspected.id.unwrap_or_else(|| id.to_string()),
            name: inspected
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            running,
            host_ports,
        })
    }

    async fn exec(
        &self,
        id: &str,
        command: &[String],
        working_dir: Option<&str>,
    ) -> Result<ExecResult, RuntimeError> {
        use bollard::exec::{CreateExecOptions, StartExecResults};

        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions::<String> {
                    cmd: Some(command.to_vec()),
                    working_dir: working_dir.map(str::to_string),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(api_err)?;

        let mut output = String::new();
        match self.docker.start_exec(&exec.id, None).await.map_err(api_err)? {
            StartExecResults::Attached { output: mut stream, .. } => {
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(log) => output.push_str(&log.to_string()),
                        Err(e) => return Err(RuntimeError::Exec(e.to_string())),
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspected = self.docker.inspect_exec(&exec.id).await.map_err(api_err)?;
        Ok(ExecResult { exit_code: inspected.exit_code.unwrap_or(-1), output })
    }

    async fn create_network(&self, name: &str, driver: &str) -> Result<String, RuntimeError> {
        use bollard::network::CreateNetworkOptions;
        self.docker
            .create_network(CreateNetworkOptions::<String> {
                name: name.to_string(),
                driver: driver.to_string(),
                ..Default::default()
            })
            .await
            .map_err(api_err)?;
        // The network name is the stable handle; later removal goes by name.
        Ok(name.to_string())
    }

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker.remove_network(name).await.map_err(api_err)
    }

    async fn network_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_network::<String>(name, None).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(api_err(e)),
        }
    }

    async fn create_volume(&self, name: &str, driver: &str) -> Result<String, RuntimeError> {
        use bollard::volume::CreateVolumeOptions;
        let created = self
            .docker
            .create_volume(CreateVolumeOptions::<String> {
                name: name.to_string(),
                driver: driver.to_string(),
                ..Default::default()
            })
            .await
            .map_err(api_err)?;
        Ok(created.name)
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker.remove_volume(name, None).await.map_err(api_err)
    }

    async fn volume_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(api_err(e)),
        }
    }
}

/* ============================= MEMORY FAKE ============================= */

#[derive(Debug, Clone)]
pub struct MemContainer {
    pub id: String,
    pub name: String,
    pub spec: ContainerSpec,
    pub running: bool,
    pub host_ports: HashMap<u16, u16>,
    pub exec_log: Vec<Vec<String>>,
}

#[derive(Default)]
struct MemState {
    containers: HashMap<String, MemContainer>,
    networks: HashMap<String, String>,
    volumes: HashMap<String, String>,
    events: Vec<String>,
    exec_scripts: HashMap<String, VecDeque<i64>>,
    fail_create_for: HashSet<String>,
}

/// Scripted in-memory `ContainerApi` for driver and scheduler tests: records
/// an event log, auto-assigns host ports, and plays back exec exit codes per
/// container name fragment.
#[derive(Default)]
pub struct MemoryContainerApi {
    state: Mutex<MemState>,
    next_id: AtomicU64,
    next_port: AtomicU16,
}

impl MemoryContainerApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemState::default()),
            next_id: AtomicU64::new(1),
            next_port: AtomicU16::new(49152),
        }
    }

    /// Chronological log of every mutating call, e.g. `"start demo-db"`.
    pub fn events(&self) -> Vec<String> {
        self.state.lock().expect("state lock").events.clone()
    }

    /// Queue exec exit codes for any container whose name contains `fragment`.
    /// Exhausted scripts fall back to exit code 0.
    pub fn script_exec(&self, fragment: &str, exit_codes: &[i64]) {
        self.state
            .lock()
            .expect("state lock")
            .exec_scripts
            .insert(fragment.to_string(), exit_codes.iter().copied().collect());
    }

    /// Make creation fail for any container whose name contains `fragment`.
    pub fn fail_create(&self, fragment: &str) {
        self.state
            .lock()
            .expect("state lock")
            .fail_create_for
            .insert(fragment.to_string());
    }

    pub fn containers(&self) -> Vec<MemContainer> {
        self.state
            .lock()
            .expect("state lock")
            .containers
            .values()
            .cloned()
            .collect()
    }

    pub fn container_by_name(&self, fragment: &str) -> Option<MemContainer> {
        self.state
            .lock()
            .expect("state lock")
            .containers
            .values()
            .find(|c| c.name.contains(fragment))
            .cloned()
    }

    pub fn network_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .expect("state lock")
            .networks
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn volume_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .expect("state lock")
            .volumes
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Remap a container's bound host port, for probe tests that need the
    /// probe to reach a real local listener.
    pub fn set_host_port(&self, fragment: &str, container_port: u16, host_port: u16) {
        let mut state = self.state.lock().expect("state lock");
        for container in state.containers.values_mut() {
            if container.name.contains(fragment) {
                container.host_ports.insert(container_port, host_port);
            }
        }
    }
}

#[async_trait]
impl ContainerApi for MemoryContainerApi {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let id = format!("ctr-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let name = spec.name.clone().unwrap_or_else(|| id.clone());

        let mut state = self.state.lock().expect("state lock");
        if state.fail_create_for.iter().any(|f| name.contains(f.as_str())) {
            return Err(RuntimeError::Api(format!("simulated create failure for {name}")));
        }

        let mut host_ports = HashMap::new();
        for port in &spec.ports {
            let host = port
                .host_port
                .unwrap_or_else(|| self.next_port.fetch_add(1, Ordering::SeqCst));
            host_ports.insert(port.container_port, host);
        }

        state.events.push(format!("create {name}"));
        state.containers.insert(
            id.clone(),
            MemContainer {
                id: id.clone(),
                name,
                spec: spec.clone(),
                running: false,
                host_ports,
                exec_log: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().expect("state lock");
        let name = match state.containers.get_mut(id) {
            Some(container) => {
                container.running = true;
                container.name.clone()
            }
            None => return Err(RuntimeError::NotFound(id.to_string())),
        };
        state.events.push(format!("start {name}"));
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().expect("state lock");
        let name = match state.containers.get_mut(id) {
            Some(container) => {
                container.running = false;
                container.name.clone()
            }
            None => return Err(RuntimeError::NotFound(id.to_string())),
        };
        state.events.push(format!("stop {name}"));
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().expect("state lock");
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if container.running && !force {
            return Err(RuntimeError::Api(format!("container {} is running", container.name)));
        }
        let name = container.name.clone();
        state.containers.remove(id);
        state.events.push(format!("remove {name}"));
        Ok(())
    }

    async fn list_containers(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let state = self.state.lock().expect("state lock");
        Ok(state
            .containers
            .values()
            .filter(|c| c.spec.labels.get(label).map(String::as_str) == Some(value))
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone(),
                labels: c.spec.labels.clone(),
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
        let state = self.state.lock().expect("state lock");
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        Ok(ContainerInfo {
            id: container.id.clone(),
            name: container.name.clone(),
            running: container.running,
            host_ports: container.host_ports.clone(),
        })
    }

    async fn exec(
        &self,
        id: &str,
        command: &[String],
        _working_dir: Option<&str>,
    ) -> Result<ExecResult, RuntimeError> {
        let mut state = self.state.lock().expect("state lock");
        let name = match state.containers.get_mut(id) {
            Some(container) => {
                container.exec_log.push(command.to_vec());
                container.name.clone()
            }
            None => return Err(RuntimeError::NotFound(id.to_string())),
        };

        let program = command.first().cloned().unwrap_or_default();
        state.events.push(format!("exec {name} {program}"));

        let exit_code = state
            .exec_scripts
            .iter_mut()
            .find(|(fragment, _)| name.contains(fragment.as_str()))
            .and_then(|(_, codes)| codes.pop_front())
            .unwrap_or(0);
        Ok(ExecResult { exit_code, output: String::new() })
    }

    async fn create_network(&self, name: &str, driver: &str) -> Result<String, RuntimeError> {
        let mut state = self.state.lock().expect("state lock");
        let id = format!("net-{name}");
        state.networks.insert(name.to_string(), driver.to_string());
        state.events.push(format!("network-create {name}"));
        Ok(id)
    }

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().expect("state lock");
        state.networks.remove(name);
        state.events.push(format!("network-remove {name}"));
        Ok(())
    }

    async fn network_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        Ok(self.state.lock().expect("state lock").networks.contains_key(name))
    }

    async fn create_volume(&self, name: &str, driver: &str) -> Result<String, RuntimeError> {
        let mut state = self.state.lock().expect("state lock");
        state.volumes.insert(name.to_string(), driver.to_string());
        state.events.push(format!("volume-create {name}"));
        Ok(name.to_string())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().expect("state lock");
        state.volumes.remove(name);
        state.events.push(format!("volume-remove {name}"));
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        Ok(self.state.lock().expect("state lock").volumes.contains_key(name))
    }
}
