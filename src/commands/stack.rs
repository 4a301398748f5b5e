use std::sync::Arc;

use anyhow::{Context, Result};

use tracedock::driver::ProdDriver;
use tracedock::runtime::DockerApi;
use tracedock::stack::StackDefinition;

/* ============================= VALIDATE ============================= */

pub fn validate(file: &str) -> Result<()> {
    let stack = load(file)?;
    stack.validate().context("Stack validation failed")?;

    println!("Stack '{}' is valid.\n", stack.name);
    println!("  Network ..................... {}", stack.network.name);
    println!("  Volumes ..................... {}", stack.volumes.len());
    println!("  Startup order:");
    for element in stack.startup_order() {
        let deps = stack
            .dependencies(&element.name)
            .map(|d| d.into_iter().collect::<Vec<_>>().join(", "))
            .unwrap_or_default();
        if deps.is_empty() {
            println!("    {}. {}", element.position, element.name);
        } else {
            println!("    {}. {} (after {})", element.position, element.name, deps);
        }
    }
    Ok(())
}

/* ============================= DEPLOY ============================= */

pub async fn deploy(file: &str) -> Result<()> {
    let stack = load(file)?;

    println!("Deploying stack '{}'...\n", stack.name);
    let api = Arc::new(DockerApi::connect().context("Cannot build Docker client")?);
    let driver = ProdDriver::new(api);

    let deployment = driver
        .deploy(&stack)
        .await
        .with_context(|| format!("Deployment of stack '{}' failed", stack.name))?;

    println!("Stack '{}' deployed.", stack.name);
    for (element, container) in &deployment.containers {
        match deployment.host_ports.get(element) {
            Some(port) => println!("  {element} ... {container} (host port {port})"),
            None => println!("  {element} ... {container}"),
        }
    }
    Ok(())
}

/* ============================= STOP / REMOVE ============================= */

pub async fn stop(name: &str) -> Result<()> {
    let api = Arc::new(DockerApi::connect().context("Cannot build Docker client")?);
    let driver = ProdDriver::new(api);
    driver
        .stop_stack(name)
        .await
        .with_context(|| format!("Failed to stop stack '{name}'"))?;
    println!("Stack '{name}' stopped.");
    Ok(())
}

pub async fn remove(name: &str, remove_volumes: bool) -> Result<()> {
    let api = Arc::new(DockerApi::connect().context("Cannot build Docker client")?);
    let driver = ProdDriver::new(api);
    driver
        .remove_stack(name, remove_volumes)
        .await
        .with_context(|| format!("Failed to remove stack '{name}'"))?;
    if remove_volumes {
        println!("Stack '{name}' removed, volumes included.");
    } else {
        println!("Stack '{name}' removed (volumes and network preserved).");
    }
    Ok(())
}

/* ============================= LOADING ============================= */

fn load(file: &str) -> Result<StackDefinition> {
    let input = std::fs::read_to_string(file)
        .with_context(|| format!("Cannot read stack file '{file}'"))?;
    StackDefinition::from_json(&input).context("Cannot parse stack definition")
}
