#![allow(dead_code)]

use std::collections::BTreeMap;

use chrono::Utc;

use tracedock::context::RequestContext;
use tracedock::exporter::ExportRecord;
use tracedock::record::{ActionRecord, ActionStatus};
use tracedock::stack::{NetworkConfig, StackDefinition, StackItem, VolumeConfig};

pub fn make_record(
    correlation: &str,
    operation: &str,
    status: ActionStatus,
    subject: Option<&str>,
) -> ActionRecord {
    let ctx = RequestContext {
        correlation_id: correlation.to_string(),
        operation_id: operation.to_string(),
        parent_operation_id: None,
        service_id: "test-svc".to_string(),
    };
    let started = Utc::now();
    let mut record = ActionRecord::start(&ctx, "CreateAction", "Thing", started);
    record.complete(started + chrono::Duration::milliseconds(5), status, None, None);
    record.data_subject_id = subject.map(str::to_string);
    record
}

pub fn make_export(correlation: &str, operation: &str, status: ActionStatus) -> ExportRecord {
    let mut export = ExportRecord::new(make_record(correlation, operation, status, None));
    export.request_body = Some(format!("{{\"op\":\"{operation}\"}}").into_bytes());
    export
}

pub fn make_item(position: u32, name: &str, requirements: &[&str]) -> StackItem {
    StackItem {
        schema_type: "SoftwareApplication".to_string(),
        position,
        name: name.to_string(),
        image: format!("{name}:1"),
        command: None,
        environment: BTreeMap::new(),
        ports: Vec::new(),
        volumes: Vec::new(),
        requirements: requirements.iter().map(|s| s.to_string()).collect(),
        software_requirements: Vec::new(),
        health_check: None,
        potential_action: Vec::new(),
    }
}

pub fn make_stack(name: &str, elements: Vec<StackItem>) -> StackDefinition {
    StackDefinition {
        context: "https://schema.org".to_string(),
        schema_type: "ItemList".to_string(),
        name: name.to_string(),
        description: String::new(),
        network: NetworkConfig {
            name: format!("{name}-net"),
            driver: "bridge".to_string(),
            create_if_not_exists: true,
        },
        volumes: Vec::new(),
        elements,
    }
}

pub fn make_stack_with_volumes(
    name: &str,
    volumes: &[&str],
    elements: Vec<StackItem>,
) -> StackDefinition {
    let mut stack = make_stack(name, elements);
    stack.volumes = volumes
        .iter()
        .map(|v| VolumeConfig {
            name: v.to_string(),
            driver: "local".to_string(),
            create_if_not_exists: true,
        })
        .collect();
    stack
}
