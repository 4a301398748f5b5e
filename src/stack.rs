use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/* ============================= ERRORS ============================= */

#[derive(Debug, Error)]
pub enum StackError {
    #[error("failed to parse stack definition: {0}")]
    Parse(String),
    #[error("stack name must not be empty")]
    EmptyName,
    #[error("stack has no elements")]
    NoElements,
    #[error("duplicate element name '{0}'")]
    DuplicateName(String),
    #[error("duplicate position {0}")]
    DuplicatePosition(u32),
    #[error("element '{0}' has invalid position {1} (positions start at 1)")]
    InvalidPosition(String, u32),
    #[error("element '{0}' has no image")]
    MissingImage(String),
    #[error("element '{0}' depends on itself")]
    SelfDependency(String),
    #[error("element '{element}' depends on unknown element '{dependency}'")]
    UnknownDependency { element: String, dependency: String },
    #[error("circular dependency detected involving '{0}'")]
    CircularDependency(String),
    #[error("unknown element '{0}'")]
    UnknownElement(String),
}

/* ============================= DEFAULTS ============================= */

fn default_context() -> String {
    "https://schema.org".to_string()
}

fn default_list_type() -> String {
    "ItemList".to_string()
}

fn default_item_type() -> String {
    "SoftwareApplication".to_string()
}

fn default_action_type() -> String {
    "Action".to_string()
}

fn default_network_driver() -> String {
    "bridge".to_string()
}

fn default_volume_driver() -> String {
    "local".to_string()
}

fn default_true() -> bool {
    true
}

fn default_interval() -> u64 {
    10
}

fn default_timeout() -> u64 {
    5
}

fn default_retries() -> u32 {
    3
}

fn default_start_period() -> u64 {
    10
}

fn default_action_timeout() -> u64 {
    60
}

/* ============================= MODEL ============================= */

/// A declarative multi-container stack, parsed from a JSON-LD ItemList.
/// Immutable after parse; defaults fill in during deserialization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StackDefinition {
    #[serde(rename = "@context", default = "default_context")]
    pub context: String,
    #[serde(rename = "@type", default = "default_list_type")]
    pub schema_type: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub network: NetworkConfig,
    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,
    #[serde(rename = "itemListElement", default)]
    pub elements: Vec<StackItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    pub name: String,
    #[serde(default = "default_network_driver")]
    pub driver: String,
    #[serde(default = "default_true")]
    pub create_if_not_exists: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeConfig {
    pub name: String,
    #[serde(default = "default_volume_driver")]
    pub driver: String,
    #[serde(default = "default_true")]
    pub create_if_not_exists: bool,
}

/// One container of the stack, ordered by `position`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StackItem {
    #[serde(rename = "@type", default = "default_item_type")]
    pub schema_type: String,
    pub position: u32,
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    /// Hard ordering dependencies; must already be deployed at start time.
    #[serde(default)]
    pub requirements: Vec<String>,
    /// Dependencies that may additionally gate on health.
    #[serde(default)]
    pub software_requirements: Vec<SoftwareRequirement>,
    #[serde(default)]
    pub health_check: Option<HealthCheck>,
    #[serde(rename = "potentialAction", default)]
    pub potential_action: Vec<PostStartAction>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub container_port: u16,
    #[serde(default)]
    pub host_port: Option<u16>,
    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MountType {
    #[default]
    Volume,
    Bind,
    Tmpfs,
}

impl MountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountType::Volume => "volume",
            MountType::Bind => "bind",
            MountType::Tmpfs => "tmpfs",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(rename = "type", default)]
    pub mount_type: MountType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SoftwareRequirement {
    pub name: String,
    #[serde(default)]
    pub wait_for_healthy: bool,
}

/// Readiness probe. The `type` tag picks the dispatch; an unknown type is a
/// parse error, never a skipped check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    #[serde(flatten)]
    pub probe: ProbeSpec,
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_start_period")]
    pub start_period_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProbeSpec {
    Command {
        command: Vec<String>,
    },
    Http {
        path: String,
        #[serde(default)]
        port: Option<u16>,
    },
    Tcp {
        #[serde(default)]
        port: Option<u16>,
    },
    Postgres,
    Redis,
}

/// One-shot command executed inside the container after its health check
/// passes (migrations, seeds).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostStartAction {
    pub name: String,
    #[serde(rename = "actionType", default = "default_action_type")]
    pub action_type: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default = "default_action_timeout")]
    pub timeout_sec: u64,
}

/* ============================= PARSE / SERIALIZE ============================= */

impl StackDefinition {
    pub fn from_json(input: &str) -> Result<Self, StackError> {
        serde_json::from_str(input).map_err(|e| StackError::Parse(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, StackError> {
        serde_json::to_string_pretty(self).map_err(|e| StackError::Parse(e.to_string()))
    }

    pub fn element(&self, name: &str) -> Option<&StackItem> {
        self.elements.iter().find(|e| e.name == name)
    }

    /* ============================= VALIDATION ============================= */

    /// Structural validation: non-empty name, at least one element, unique
    /// names and positions, images present, resolvable acyclic dependencies.
    pub fn validate(&self) -> Result<(), StackError> {
        if self.name.trim().is_empty() {
            return Err(StackError::EmptyName);
        }
        if self.elements.is_empty() {
            return Err(StackError::NoElements);
        }

        let mut names = BTreeSet::new();
        let mut positions = BTreeSet::new();
        for element in &self.elements {
            if element.position == 0 {
                return Err(StackError::InvalidPosition(element.name.clone(), element.position));
            }
            if element.image.trim().is_empty() {
                return Err(StackError::MissingImage(element.name.clone()));
            }
            if !names.insert(element.name.as_str()) {
                return Err(StackError::DuplicateName(element.name.clone()));
            }
            if !positions.insert(element.position) {
                return Err(StackError::DuplicatePosition(element.position));
            }
        }

        for element in &self.elements {
            for dependency in element.dependency_names() {
                if dependency == element.name {
                    return Err(StackError::SelfDependency(element.name.clone()));
                }
                if !names.contains(dependency.as_str()) {
                    return Err(StackError::UnknownDependency {
                        element: element.name.clone(),
                        dependency,
                    });
                }
            }
        }

        self.detect_cycle()
    }

    /// Three-colour depth-first search over the union of `requirements` and
    /// `software_requirements` edges; the first back-edge names the offender.
    fn detect_cycle(&self) -> Result<(), StackError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Colour {
            White,
            Grey,
            Black,
        }

        let index: HashMap<&str, usize> = self
            .elements
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.as_str(), i))
            .collect();

        let adjacency: Vec<Vec<usize>> = self
            .elements
            .iter()
            .map(|e| {
                e.dependency_names()
                    .filter_map(|d| index.get(d.as_str()).copied())
                    .collect()
            })
            .collect();

        fn visit(
            node: usize,
            adjacency: &[Vec<usize>],
            colours: &mut [Colour],
        ) -> Option<usize> {
            colours[node] = Colour::Grey;
            for &next in &adjacency[node] {
                match colours[next] {
                    Colour::Grey => return Some(next),
                    Colour::White => {
                        if let Some(offender) = visit(next, adjacency, colours) {
                            return Some(offender);
                        }
                    }
                    Colour::Black => {}
                }
            }
            colours[node] = Colour::Black;
            None
        }

        let mut colours = vec![Colour::White; self.elements.len()];
        for start in 0..self.elements.len() {
            if colours[start] == Colour::White {
                if let Some(offender) = visit(start, &adjacency, &mut colours) {
                    return Err(StackError::CircularDependency(
                        self.elements[offender].name.clone(),
                    ));
                }
            }
        }
        Ok(())
    }

    /* ============================= ORDERING ============================= */

    /// Elements sorted by position ascending. Positions are the authoritative
    /// startup order; the dependency graph is a validated cross-check, not a
    /// topological-sort source.
    pub fn startup_order(&self) -> Vec<&StackItem> {
        let mut ordered: Vec<&StackItem> = self.elements.iter().collect();
        ordered.sort_by_key(|e| e.position);
        ordered
    }

    /// Transitive dependency closure of one element.
    pub fn dependencies(&self, name: &str) -> Result<BTreeSet<String>, StackError> {
        let start = self
            .element(name)
            .ok_or_else(|| StackError::UnknownElement(name.to_string()))?;

        let mut closure = BTreeSet::new();
        let mut queue: VecDeque<String> = start.dependency_names().collect();
        while let Some(dependency) = queue.pop_front() {
            if !closure.insert(dependency.clone()) {
                continue;
            }
            if let Some(element) = self.element(&dependency) {
                queue.extend(element.dependency_names());
            }
        }
        Ok(closure)
    }
}

impl StackItem {
    /// Union of hard requirements and software requirement names.
    pub fn dependency_names(&self) -> impl Iterator<Item = String> + '_ {
        self.requirements
            .iter()
            .cloned()
            .chain(self.software_requirements.iter().map(|r| r.name.clone()))
    }
}
