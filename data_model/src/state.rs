//! Engine state blob as stored in `state/{app}/{env}.json`.
//!
//! Only the fields the state layer reasons about are typed. Everything else
//! the engine writes is carried through `extra` so a pull/repair/push cycle
//! does not drop data.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Resource type of the root stack resource, which owns the stack outputs.
pub const STACK_RESOURCE_TYPE: &str = "pulumi:pulumi:Stack";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateBlob {
    #[serde(default)]
    pub version: u32,
    pub checkpoint: Checkpoint,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    #[serde(default)]
    pub stack: String,
    #[serde(default)]
    pub latest: Option<Deployment>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    #[serde(default)]
    pub resources: Vec<ResourceRecord>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRecord {
    pub urn: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<String>>,
    #[serde(
        default,
        rename = "propertyDependencies",
        skip_serializing_if = "Option::is_none"
    )]
    pub property_dependencies: Option<BTreeMap<String, Vec<String>>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResourceRecord {
    pub fn new(urn: &str, resource_type: &str) -> Self {
        Self {
            urn: urn.to_string(),
            resource_type: resource_type.to_string(),
            parent: None,
            dependencies: None,
            property_dependencies: None,
            extra: Map::new(),
        }
    }

    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_string());
        self
    }

    pub fn with_dependencies(mut self, dependencies: &[&str]) -> Self {
        self.dependencies = Some(dependencies.iter().map(|d| d.to_string()).collect());
        self
    }

    pub fn with_property_dependency(mut self, property: &str, urns: &[&str]) -> Self {
        self.property_dependencies
            .get_or_insert_with(BTreeMap::new)
            .insert(
                property.to_string(),
                urns.iter().map(|u| u.to_string()).collect(),
            );
        self
    }

    pub fn name(&self) -> &str {
        urn_name(&self.urn)
    }
}

impl StateBlob {
    pub fn new(stack: &str, resources: Vec<ResourceRecord>) -> Self {
        Self {
            version: 3,
            checkpoint: Checkpoint {
                stack: stack.to_string(),
                latest: Some(Deployment {
                    resources,
                    extra: Map::new(),
                }),
                extra: Map::new(),
            },
            extra: Map::new(),
        }
    }

    pub fn from_slice(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }

    pub fn to_vec_pretty(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    pub fn resources(&self) -> &[ResourceRecord] {
        self.checkpoint
            .latest
            .as_ref()
            .map(|latest| latest.resources.as_slice())
            .unwrap_or_default()
    }

    pub fn resources_mut(&mut self) -> &mut Vec<ResourceRecord> {
        &mut self
            .checkpoint
            .latest
            .get_or_insert_with(Deployment::default)
            .resources
    }

    pub fn resource_count(&self) -> usize {
        self.resources().len()
    }

    /// Outputs of the root stack resource, if the stack has been deployed.
    pub fn stack_outputs(&self) -> Option<&Map<String, Value>> {
        self.resources()
            .iter()
            .find(|r| r.resource_type == STACK_RESOURCE_TYPE)
            .and_then(|r| r.extra.get("outputs"))
            .and_then(Value::as_object)
    }
}

/// Trailing name component of a URN
/// (`urn:pulumi:{stack}::{project}::{type}::{name}`). Strings without `::`
/// are returned whole.
pub fn urn_name(urn: &str) -> &str {
    match urn.splitn(4, "::").nth(3) {
        Some(name) => name,
        None => urn.rsplit("::").next().unwrap_or(urn),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MutationAction {
    RemoveResource,
    RemoveDependency,
    RemovePropertyDependency,
}

/// One change made to a state blob by removal or repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub action: MutationAction,
    pub target_urn: String,
    pub detail: String,
}

impl Mutation {
    pub fn new(action: MutationAction, target_urn: &str, detail: String) -> Self {
        Self {
            action,
            target_urn: target_urn.to_string(),
            detail,
        }
    }

    pub fn target_name(&self) -> &str {
        urn_name(&self.target_urn)
    }
}
