use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

use crate::runtime::{ContainerApi, RuntimeError};
use crate::stack::{HealthCheck, ProbeSpec};

/* ============================= ERRORS ============================= */

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("health check failed for {name} after {attempts} attempts")]
    Failed { name: String, attempts: u32 },
    #[error("container {0} exposes no port to probe")]
    NoPort(String),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/* ============================= WAIT LOOP ============================= */

/// Block until the container's health check passes or the attempt budget is
/// spent: sleep `start_period`, then up to `retries` attempts (floor one),
/// each bounded by `timeout` and separated by `interval`. An expired attempt
/// cancels its in-flight probe.
pub async fn wait_ready<A: ContainerApi + ?Sized>(
    api: &A,
    element_name: &str,
    container_id: &str,
    check: &HealthCheck,
) -> Result<(), ProbeError> {
    if check.start_period_seconds > 0 {
        tokio::time::sleep(Duration::from_secs(check.start_period_seconds)).await;
    }

    let attempts = check.retries.max(1);
    for attempt in 1..=attempts {
        let outcome = tokio::time::timeout(
            Duration::from_secs(check.timeout_seconds.max(1)),
            probe_once(api, container_id, &check.probe),
        )
        .await;

        match outcome {
            Ok(Ok(true)) => {
                debug!(element = %element_name, attempt, "probe_passed");
                return Ok(());
            }
            Ok(Ok(false)) => {
                debug!(element = %element_name, attempt, "probe_failed");
            }
            Ok(Err(e @ ProbeError::NoPort(_))) => return Err(e),
            Ok(Err(e)) => {
                // Transient runtime errors count as a failed attempt.
                debug!(element = %element_name, attempt, error = %e, "probe_errored");
            }
            Err(_) => {
                debug!(element = %element_name, attempt, "probe_timed_out");
            }
        }

        if attempt < attempts && check.interval_seconds > 0 {
            tokio::time::sleep(Duration::from_secs(check.interval_seconds)).await;
        }
    }

    Err(ProbeError::Failed { name: element_name.to_string(), attempts })
}

/* ============================= DISPATCH ============================= */

const POSTGRES_PROBE: &[&str] = &["pg_isready", "-U", "postgres"];
const REDIS_PROBE: &[&str] = &["redis-cli", "ping"];

async fn probe_once<A: ContainerApi + ?Sized>(
    api: &A,
    container_id: &str,
    probe: &ProbeSpec,
) -> Result<bool, ProbeError> {
    match probe {
        ProbeSpec::Command { command } => exec_probe(api, container_id, command).await,
        ProbeSpec::Postgres => {
            let command: Vec<String> = POSTGRES_PROBE.iter().map(|s| s.to_string()).collect();
            exec_probe(api, container_id, &command).await
        }
        ProbeSpec::Redis => {
            let command: Vec<String> = REDIS_PROBE.iter().map(|s| s.to_string()).collect();
            exec_probe(api, container_id, &command).await
        }
        ProbeSpec::Http { path, port } => {
            let host_port = resolve_host_port(api, container_id, *port).await?;
            let path = if path.starts_with('/') { path.clone() } else { format!("/{path}") };
            let url = format!("http://127.0.0.1:{host_port}{path}");
            match reqwest::get(&url).await {
                Ok(response) => Ok(response.status().is_success()),
                Err(_) => Ok(false),
            }
        }
        ProbeSpec::Tcp { port } => {
            let host_port = resolve_host_port(api, container_id, *port).await?;
            Ok(TcpStream::connect(("127.0.0.1", host_port)).await.is_ok())
        }
    }
}

async fn exec_probe<A: ContainerApi + ?Sized>(
    api: &A,
    container_id: &str,
    command: &[String],
) -> Result<bool, ProbeError> {
    let result = api.exec(container_id, command, None).await?;
    Ok(result.success())
}

/// Host-reachable port for the probe: the specified container port, or the
/// lowest exposed one.
async fn resolve_host_port<A: ContainerApi + ?Sized>(
    api: &A,
    container_id: &str,
    container_port: Option<u16>,
) -> Result<u16, ProbeError> {
    let info = api.inspect_container(container_id).await?;
    let resolved = match container_port {
        Some(port) => info.host_ports.get(&port).copied(),
        None => info
            .host_ports
            .iter()
            .min_by_key(|(container, _)| **container)
            .map(|(_, host)| *host),
    };
    resolved.ok_or_else(|| ProbeError::NoPort(container_id.to_string()))
}
