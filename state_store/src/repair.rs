//! Removal of resources from a state blob and repair of the references they
//! leave behind.
//!
//! A state is consistent when every `parent`, `dependencies` and
//! `propertyDependencies` entry names a resource present in the same state.
//! Manual edits and partially failed operations break that; [`repair`]
//! restores it and reports every change as a [`Mutation`].

use std::collections::{BTreeMap, HashSet};

use data_model::{urn_name, Mutation, MutationAction, ResourceRecord, StateBlob};
use tracing::debug;

use crate::error::{Result, StateError};

/// Removes orphans and dangling dependency edges until the state is
/// consistent. Mutates `state` in place and returns what changed.
pub fn repair(state: &mut StateBlob) -> Vec<Mutation> {
    let mut mutations = Vec::new();
    let Some(latest) = state.checkpoint.latest.as_mut() else {
        return mutations;
    };
    let resources = &mut latest.resources;

    // Removing an orphan can orphan its own children, so iterate until a pass
    // finds no orphans.
    loop {
        let existing: HashSet<String> = resources.iter().map(|r| r.urn.clone()).collect();
        let mut orphans = HashSet::new();

        for resource in resources.iter_mut() {
            if let Some(parent) = &resource.parent {
                if !existing.contains(parent) {
                    mutations.push(Mutation::new(
                        MutationAction::RemoveResource,
                        &resource.urn,
                        format!("parent {} no longer exists", parent),
                    ));
                    orphans.insert(resource.urn.clone());
                    continue;
                }
            }
            prune_dependencies(resource, &existing, &mut mutations);
            prune_property_dependencies(resource, &existing, &mut mutations);
        }

        if orphans.is_empty() {
            break;
        }
        debug!(count = orphans.len(), "removing orphaned resources");
        resources.retain(|r| !orphans.contains(&r.urn));
    }
    mutations
}

fn prune_dependencies(
    resource: &mut ResourceRecord,
    existing: &HashSet<String>,
    mutations: &mut Vec<Mutation>,
) {
    let Some(dependencies) = resource.dependencies.as_mut() else {
        return;
    };
    let urn = &resource.urn;
    dependencies.retain(|dependency| {
        if existing.contains(dependency) {
            return true;
        }
        mutations.push(Mutation::new(
            MutationAction::RemoveDependency,
            urn,
            format!("dependency {} no longer exists", dependency),
        ));
        false
    });
}

fn prune_property_dependencies(
    resource: &mut ResourceRecord,
    existing: &HashSet<String>,
    mutations: &mut Vec<Mutation>,
) {
    let Some(property_dependencies) = resource.property_dependencies.as_mut() else {
        return;
    };
    let urn = &resource.urn;
    let mut emptied = Vec::new();
    for (property, dependencies) in property_dependencies.iter_mut() {
        let before = dependencies.len();
        dependencies.retain(|dependency| {
            if existing.contains(dependency) {
                return true;
            }
            mutations.push(Mutation::new(
                MutationAction::RemovePropertyDependency,
                urn,
                format!("{}: dependency {} no longer exists", property, dependency),
            ));
            false
        });
        // the engine treats an empty list differently from a missing key
        if before > 0 && dependencies.is_empty() {
            emptied.push(property.clone());
        }
    }
    remove_keys(property_dependencies, &emptied);
}

fn remove_keys(map: &mut BTreeMap<String, Vec<String>>, keys: &[String]) {
    for key in keys {
        map.remove(key);
    }
}

/// Deletes the resource with `urn`, then repairs the state. Children are not
/// removed directly; they become orphans and `repair` removes them.
pub fn remove_resource(state: &mut StateBlob, urn: &str) -> Result<Vec<Mutation>> {
    let resources = state
        .checkpoint
        .latest
        .as_mut()
        .map(|latest| &mut latest.resources)
        .ok_or_else(|| StateError::ResourceNotFound(urn.to_string()))?;
    let index = resources
        .iter()
        .position(|r| r.urn == urn)
        .ok_or_else(|| StateError::ResourceNotFound(urn.to_string()))?;
    let removed = resources.remove(index);

    let mut mutations = vec![Mutation::new(
        MutationAction::RemoveResource,
        &removed.urn,
        format!("removed {} ({})", removed.name(), removed.resource_type),
    )];
    mutations.extend(repair(state));
    Ok(mutations)
}

pub fn find_resource<'a>(state: &'a StateBlob, urn: &str) -> Option<&'a ResourceRecord> {
    state.resources().iter().find(|r| r.urn == urn)
}

/// Resources whose URN ends in `::{name}`. More than one match means the name
/// is ambiguous and the caller must ask for a full URN.
pub fn find_resources_by_name<'a>(state: &'a StateBlob, name: &str) -> Vec<&'a ResourceRecord> {
    state
        .resources()
        .iter()
        .filter(|r| urn_name(&r.urn) == name)
        .collect()
}
