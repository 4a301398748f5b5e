use serde_json::{Map, Value};

/* ============================= DISPATCH TABLE ============================= */

/// Metadata keys extracted per (action_type, object_type) pair, with the
/// camelCase payload field each one is read from.
///
/// Values are looked up in the response `result` object first, then the
/// request `object` object. Missing fields are omitted, never zeroed.
const CREATE_SOFTWARE_APPLICATION: &[(&str, &str)] = &[
    ("container_id", "containerId"),
    ("image", "image"),
    ("started", "started"),
    ("ports", "ports"),
    ("health_status", "healthStatus"),
];

const TRANSFER_DATABASE: &[(&str, &str)] = &[
    ("source_database", "sourceDatabase"),
    ("target_database", "targetDatabase"),
    ("total_tables", "totalTables"),
    ("completed_tables", "completedTables"),
    ("total_rows", "totalRows"),
    ("transferred_rows", "transferredRows"),
    ("progress_percent", "progressPercent"),
    ("current_table", "currentTable"),
];

const UPLOAD_DATASET: &[(&str, &str)] = &[
    ("backup_type", "backupType"),
    ("source_database", "sourceDatabase"),
    ("backup_size_bytes", "backupSizeBytes"),
    ("checksum", "checksum"),
    ("storage_location", "storageLocation"),
    ("expires_at", "expiresAt"),
];

const EXECUTE_SOFTWARE_SOURCE_CODE: &[(&str, &str)] = &[
    ("repository", "repository"),
    ("branch", "branch"),
    ("commit_sha", "commitSha"),
    ("build_number", "buildNumber"),
    ("tests_passed", "testsPassed"),
    ("tests_failed", "testsFailed"),
    ("artifacts_count", "artifactsCount"),
];

const REPLACE_DATA_FEED: &[(&str, &str)] = &[
    ("destination_table", "destinationTable"),
    ("input_rows", "inputRows"),
    ("output_rows", "outputRows"),
    ("filtered_rows", "filteredRows"),
    ("rows_per_second", "rowsPerSecond"),
    ("data_quality_passed", "dataQualityPassed"),
];

const SHAPES: &[(&str, &str, &[(&str, &str)])] = &[
    ("CreateAction", "SoftwareApplication", CREATE_SOFTWARE_APPLICATION),
    ("TransferAction", "Database", TRANSFER_DATABASE),
    ("UploadAction", "Dataset", UPLOAD_DATASET),
    ("ExecuteAction", "SoftwareSourceCode", EXECUTE_SOFTWARE_SOURCE_CODE),
    ("ReplaceAction", "DataFeed", REPLACE_DATA_FEED),
];

fn dispatch(action_type: &str, object_type: &str) -> Option<&'static [(&'static str, &'static str)]> {
    SHAPES
        .iter()
        .find(|(action, object, _)| *action == action_type && *object == object_type)
        .map(|(_, _, keys)| *keys)
}

/// The dispatch table as (action_type, object_type, output keys) rows, for
/// the metadata schema registry.
pub fn known_shapes() -> Vec<(&'static str, &'static str, Vec<&'static str>)> {
    SHAPES
        .iter()
        .map(|(action, object, keys)| (*action, *object, keys.iter().map(|(k, _)| *k).collect()))
        .collect()
}

/* ============================= EXTRACTION ============================= */

/// Project request/response payloads into a small typed metadata map.
///
/// Pure function of its inputs. Unknown pairs fall back to `object_name` /
/// `object_identifier` from the request object. Anything unparseable simply
/// contributes nothing; extraction never fails the request.
pub fn extract_metadata(
    action_type: &str,
    object_type: &str,
    request: Option<&Value>,
    response: Option<&Value>,
) -> Map<String, Value> {
    let mut out = Map::new();

    let request_object = request.and_then(|v| v.get("object"));
    let response_result = response.and_then(|v| v.get("result"));

    match dispatch(action_type, object_type) {
        Some(keys) => {
            for (out_key, payload_key) in keys {
                let value = response_result
                    .and_then(|r| r.get(*payload_key))
                    .or_else(|| request_object.and_then(|o| o.get(*payload_key)));
                if let Some(v) = value {
                    if !v.is_null() {
                        out.insert((*out_key).to_string(), v.clone());
                    }
                }
            }
        }
        None => {
            if let Some(name) = request_object.and_then(|o| o.get("name")) {
                if !name.is_null() {
                    out.insert("object_name".to_string(), name.clone());
                }
            }
            let identifier = request_object
                .and_then(|o| o.get("identifier"))
                .or_else(|| request_object.and_then(|o| o.get("@id")));
            if let Some(id) = identifier {
                if !id.is_null() {
                    out.insert("object_identifier".to_string(), id.clone());
                }
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── CreateAction / SoftwareApplication ──

    #[test]
    fn test_create_software_application() {
        let request = json!({
            "@type": "CreateAction",
            "object": {"@type": "SoftwareApplication", "image": "nginx"}
        });
        let response = json!({
            "result": {"containerId": "abc", "started": true, "ports": ["80:80"]}
        });

        let m = extract_metadata("CreateAction", "SoftwareApplication", Some(&request), Some(&response));

        assert_eq!(m["container_id"], json!("abc"));
        assert_eq!(m["image"], json!("nginx"));
        assert_eq!(m["started"], json!(true));
        assert_eq!(m["ports"], json!(["80:80"]));
        assert!(!m.contains_key("health_status"), "missing fields are omitted");
    }

    #[test]
    fn test_response_wins_over_request() {
        let request = json!({"object": {"image": "nginx:old"}});
        let response = json!({"result": {"image": "nginx:1.25"}});
        let m = extract_metadata("CreateAction", "SoftwareApplication", Some(&request), Some(&response));
        assert_eq!(m["image"], json!("nginx:1.25"));
    }

    // ── TransferAction / Database ──

    #[test]
    fn test_transfer_database() {
        let response = json!({
            "result": {
                "sourceDatabase": "orders",
                "targetDatabase": "orders_v2",
                "totalTables": 12,
                "completedTables": 12,
                "totalRows": 40000,
                "transferredRows": 40000,
                "progressPercent": 100.0,
                "currentTable": "line_items"
            }
        });
        let m = extract_metadata("TransferAction", "Database", None, Some(&response));
        assert_eq!(m.len(), 8);
        assert_eq!(m["source_database"], json!("orders"));
        assert_eq!(m["progress_percent"], json!(100.0));
    }

    // ── UploadAction / Dataset ──

    #[test]
    fn test_upload_dataset_partial() {
        let response = json!({
            "result": {"backupType": "full", "backupSizeBytes": 1048576, "checksum": "deadbeef"}
        });
        let m = extract_metadata("UploadAction", "Dataset", None, Some(&response));
        assert_eq!(m["backup_type"], json!("full"));
        assert_eq!(m["backup_size_bytes"], json!(1048576));
        assert!(!m.contains_key("storage_location"));
        assert!(!m.contains_key("expires_at"));
    }

    // ── ExecuteAction / SoftwareSourceCode ──

    #[test]
    fn test_execute_source_code() {
        let request = json!({"object": {"repository": "acme/api", "branch": "main"}});
        let response = json!({
            "result": {"commitSha": "0a1b2c3", "buildNumber": 77, "testsPassed": 120, "testsFailed": 0}
        });
        let m = extract_metadata("ExecuteAction", "SoftwareSourceCode", Some(&request), Some(&response));
        assert_eq!(m["repository"], json!("acme/api"));
        assert_eq!(m["branch"], json!("main"));
        assert_eq!(m["commit_sha"], json!("0a1b2c3"));
        assert_eq!(m["tests_failed"], json!(0));
    }

    // ── ReplaceAction / DataFeed ──

    #[test]
    fn test_replace_data_feed() {
        let response = json!({
            "result": {
                "destinationTable": "facts",
                "inputRows": 100,
                "outputRows": 95,
                "filteredRows": 5,
                "rowsPerSecond": 12.5,
                "dataQualityPassed": true
            }
        });
        let m = extract_metadata("ReplaceAction", "DataFeed", None, Some(&response));
        assert_eq!(m["filtered_rows"], json!(5));
        assert_eq!(m["data_quality_passed"], json!(true));
    }

    // ── fallback ──

    #[test]
    fn test_unknown_pair_falls_back() {
        let request = json!({"object": {"name": "report-42", "identifier": "r-42"}});
        let m = extract_metadata("ReadAction", "Report", Some(&request), None);
        assert_eq!(m["object_name"], json!("report-42"));
        assert_eq!(m["object_identifier"], json!("r-42"));
    }

    #[test]
    fn test_fallback_uses_json_ld_id() {
        let request = json!({"object": {"name": "thing", "@id": "urn:thing:1"}});
        let m = extract_metadata("ReadAction", "Thing", Some(&request), None);
        assert_eq!(m["object_identifier"], json!("urn:thing:1"));
    }

    #[test]
    fn test_known_action_unknown_object_falls_back() {
        let request = json!({"object": {"name": "x"}});
        let m = extract_metadata("CreateAction", "Report", Some(&request), None);
        assert_eq!(m["object_name"], json!("x"));
        assert!(!m.contains_key("container_id"));
    }

    // ── robustness ──

    #[test]
    fn test_no_bodies_yields_empty_map() {
        let m = extract_metadata("CreateAction", "SoftwareApplication", None, None);
        assert!(m.is_empty());
    }

    #[test]
    fn test_non_object_bodies_yield_empty_map() {
        let request = json!("just a string");
        let response = json!([1, 2, 3]);
        let m = extract_metadata("CreateAction", "SoftwareApplication", Some(&request), Some(&response));
        assert!(m.is_empty());
    }

    #[test]
    fn test_null_fields_omitted() {
        let response = json!({"result": {"containerId": null, "started": true}});
        let m = extract_metadata("CreateAction", "SoftwareApplication", None, Some(&response));
        assert!(!m.contains_key("container_id"));
        assert_eq!(m["started"], json!(true));
    }

    // ── shape registry ──

    #[test]
    fn test_known_shapes_cover_dispatch_table() {
        let shapes = known_shapes();
        assert_eq!(shapes.len(), 5);
        let create = shapes
            .iter()
            .find(|(a, o, _)| *a == "CreateAction" && *o == "SoftwareApplication")
            .expect("create shape registered");
        assert_eq!(create.2, vec!["container_id", "image", "started", "ports", "health_status"]);
    }

    #[test]
    fn test_pure_function() {
        let request = json!({"object": {"image": "nginx"}});
        let response = json!({"result": {"containerId": "abc"}});
        let a = extract_metadata("CreateAction", "SoftwareApplication", Some(&request), Some(&response));
        let b = extract_metadata("CreateAction", "SoftwareApplication", Some(&request), Some(&response));
        assert_eq!(a, b);
    }
}
