mod common;

use std::sync::Arc;

use common::{make_item, make_stack, make_stack_with_volumes};
use tracedock::driver::{ProdDriver, TestDriver};
use tracedock::runtime::MemoryContainerApi;
use tracedock::scheduler::DeployError;
use tracedock::stack::{HealthCheck, PostStartAction, ProbeSpec, SoftwareRequirement};

// ══════════════════════════════════════════════════════════════════
// Scheduler + driver integration tests (no Docker required)
//
// Full deployments against the scripted in-memory container API:
// ordering, dependency gating, health failures, post-start actions,
// and the rollback split between the two drivers.
// ══════════════════════════════════════════════════════════════════

fn command_check(retries: u32) -> HealthCheck {
    HealthCheck {
        probe: ProbeSpec::Command { command: vec!["check".to_string()] },
        interval_seconds: 0,
        timeout_seconds: 1,
        retries,
        start_period_seconds: 0,
    }
}

// ── ordering ──

#[tokio::test]
async fn test_containers_start_in_position_order() {
    let api = Arc::new(MemoryContainerApi::new());
    let driver = ProdDriver::new(api.clone());
    let stack = make_stack(
        "shop",
        vec![
            make_item(3, "web", &["api"]),
            make_item(1, "db", &[]),
            make_item(2, "api", &["db"]),
        ],
    );

    driver.deploy(&stack).await.expect("deploys");

    let events = api.events();
    let starts: Vec<&String> = events.iter().filter(|e| e.starts_with("start ")).collect();
    assert_eq!(starts, vec!["start shop-db", "start shop-api", "start shop-web"]);
}

// ── dependency gating ──

#[tokio::test]
async fn test_healthy_dependency_rechecked_before_dependent_starts() {
    let api = Arc::new(MemoryContainerApi::new());
    let driver = ProdDriver::new(api.clone());

    let mut db = make_item(1, "db", &[]);
    db.health_check = Some(command_check(3));
    let mut api_item = make_item(2, "api", &[]);
    api_item.software_requirements.push(SoftwareRequirement {
        name: "db".to_string(),
        wait_for_healthy: true,
    });

    let stack = make_stack("shop", vec![db, api_item]);
    driver.deploy(&stack).await.expect("deploys");

    // The db health command runs once for its own readiness and once as the
    // dependency gate for api.
    let db_execs = api.container_by_name("shop-db").unwrap().exec_log.len();
    assert_eq!(db_execs, 2);
}

#[tokio::test]
async fn test_dependency_positioned_later_fails_at_runtime() {
    let api = Arc::new(MemoryContainerApi::new());
    let driver = ProdDriver::new(api.clone());
    // Validates fine (no cycle, dep resolves) but "web" starts first and its
    // dependency is not deployed yet.
    let stack = make_stack("shop", vec![make_item(1, "web", &["db"]), make_item(2, "db", &[])]);

    let err = driver.deploy(&stack).await.expect_err("must fail");
    assert!(
        matches!(err, DeployError::DependencyNotFound(ref name) if name == "db"),
        "got: {err}"
    );
}

#[tokio::test]
async fn test_unhealthy_dependency_blocks_dependent() {
    let api = Arc::new(MemoryContainerApi::new());
    let driver = ProdDriver::new(api.clone());

    let mut db = make_item(1, "db", &[]);
    db.health_check = Some(command_check(2));
    let mut web = make_item(2, "web", &[]);
    web.software_requirements.push(SoftwareRequirement {
        name: "db".to_string(),
        wait_for_healthy: true,
    });
    let stack = make_stack("shop", vec![db, web]);

    // db passes its own check, then fails both gate attempts.
    api.script_exec("db", &[0, 1, 1]);

    let err = driver.deploy(&stack).await.expect_err("gate must fail");
    let message = err.to_string();
    assert!(message.contains("dependency wait failed for db"), "got: {message}");
    assert!(api.container_by_name("shop-web").is_none(), "web never created");
}

// ── health checks ──

#[tokio::test]
async fn test_health_failure_names_element_and_attempts() {
    let api = Arc::new(MemoryContainerApi::new());
    let driver = ProdDriver::new(api.clone());

    let mut db = make_item(1, "db", &[]);
    db.health_check = Some(command_check(2));
    let stack = make_stack("shop", vec![db]);
    api.script_exec("db", &[1, 1]);

    let err = driver.deploy(&stack).await.expect_err("health must fail");
    assert_eq!(err.to_string(), "health check failed for db after 2 attempts");
}

// ── post-start actions ──

#[tokio::test]
async fn test_post_start_actions_run_in_order() {
    let api = Arc::new(MemoryContainerApi::new());
    let driver = ProdDriver::new(api.clone());

    let mut db = make_item(1, "db", &[]);
    db.potential_action = vec![
        PostStartAction {
            name: "migrate".to_string(),
            action_type: "Action".to_string(),
            command: vec!["migrate".to_string()],
            working_directory: None,
            timeout_sec: 5,
        },
        PostStartAction {
            name: "seed".to_string(),
            action_type: "Action".to_string(),
            command: vec!["seed".to_string()],
            working_directory: Some("/app".to_string()),
            timeout_sec: 5,
        },
    ];
    let stack = make_stack("shop", vec![db]);

    driver.deploy(&stack).await.expect("deploys");

    let log = api.container_by_name("shop-db").unwrap().exec_log;
    assert_eq!(log, vec![vec!["migrate".to_string()], vec!["seed".to_string()]]);
}

#[tokio::test]
async fn test_post_start_failure_names_action_and_code() {
    let api = Arc::new(MemoryContainerApi::new());
    let driver = ProdDriver::new(api.clone());

    let mut db = make_item(1, "db", &[]);
    db.potential_action = vec![PostStartAction {
        name: "migrate".to_string(),
        action_type: "Action".to_string(),
        command: vec!["migrate".to_string()],
        working_directory: None,
        timeout_sec: 5,
    }];
    let stack = make_stack("shop", vec![db]);
    api.script_exec("db", &[3]);

    let err = driver.deploy(&stack).await.expect_err("action must fail");
    assert_eq!(err.to_string(), "post-start action migrate exited with code 3");
}

#[tokio::test]
async fn test_post_start_failure_aborts_remaining_elements() {
    let api = Arc::new(MemoryContainerApi::new());
    let driver = ProdDriver::new(api.clone());

    let mut db = make_item(1, "db", &[]);
    db.potential_action = vec![PostStartAction {
        name: "migrate".to_string(),
        action_type: "Action".to_string(),
        command: vec!["migrate".to_string()],
        working_directory: None,
        timeout_sec: 5,
    }];
    let stack = make_stack("shop", vec![db, make_item(2, "web", &[])]);
    api.script_exec("db", &[1]);

    assert!(driver.deploy(&stack).await.is_err());
    assert!(api.container_by_name("shop-web").is_none(), "deployment aborted before web");
}

// ── driver failure policies ──

#[tokio::test]
async fn test_test_driver_rolls_back_production_driver_does_not() {
    let stack = make_stack_with_volumes(
        "shop",
        &["shop-data"],
        vec![make_item(1, "db", &[]), make_item(2, "web", &["db"])],
    );

    // Production: partial state stays.
    let prod_api = Arc::new(MemoryContainerApi::new());
    prod_api.fail_create("web");
    let prod = ProdDriver::new(prod_api.clone());
    assert!(prod.deploy(&stack).await.is_err());
    assert!(prod_api.container_by_name("shop-db").is_some());
    assert!(!prod_api.network_names().is_empty());

    // Test: everything started so far is torn down.
    let test_api = Arc::new(MemoryContainerApi::new());
    test_api.fail_create("web");
    let test = TestDriver::new(test_api.clone());
    assert!(test.deploy(&stack).await.is_err());
    assert!(test_api.containers().is_empty());
    assert!(test_api.network_names().is_empty());
    assert!(test_api.volume_names().is_empty());
}

// ── deployment record ──

#[tokio::test]
async fn test_deployment_record_contents() {
    let api = Arc::new(MemoryContainerApi::new());
    let driver = ProdDriver::new(api.clone());

    let mut db = make_item(1, "db", &[]);
    db.ports.push(tracedock::stack::PortMapping {
        container_port: 5432,
        host_port: Some(15432),
        protocol: tracedock::stack::Protocol::Tcp,
    });
    let stack = make_stack_with_volumes("shop", &["shop-data"], vec![db]);

    let deployment = driver.deploy(&stack).await.expect("deploys");

    assert_eq!(deployment.stack_name, "shop");
    assert_eq!(deployment.containers.len(), 1);
    assert_eq!(deployment.host_ports.get("db"), Some(&15432));
    assert!(deployment.network_id.is_some());
    assert!(deployment.volumes.contains_key("shop-data"));
}

#[tokio::test]
async fn test_ephemeral_deployment_maps_random_ports() {
    let api = Arc::new(MemoryContainerApi::new());
    let driver = TestDriver::new(api.clone());

    let mut db = make_item(1, "db", &[]);
    db.ports.push(tracedock::stack::PortMapping {
        container_port: 5432,
        host_port: Some(15432),
        protocol: tracedock::stack::Protocol::Tcp,
    });
    let stack = make_stack("shop", vec![db]);

    let handle = driver.deploy(&stack).await.expect("deploys");
    let port = handle.host_port("db").expect("port mapped");
    assert_ne!(port, 15432, "fixed host port ignored in ephemeral runs");
    handle.cleanup().await;
}
