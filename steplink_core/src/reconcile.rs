//! Entity lifecycle reconciliation.
//!
//! After every authoritative reply the registry must converge to exactly the
//! entity set the snapshot lists:
//!
//! ```text
//!   snapshot ids  \  registry ids   ->  create + pre-initialize
//!   snapshot ids  ∩  registry ids   ->  apply_kinematics
//!   registry ids  \  snapshot ids   ->  remove + factory.destroy
//! ```
//!
//! One pass over the snapshot, one pass over the leftovers; no id is visited
//! twice. A kind the factory cannot build aborts reconciliation with
//! [`BridgeError::UnknownKind`]: updates and creations already performed that
//! pass stay applied, and no destruction happens, so the registry never loses
//! entities to a half-applied snapshot.

use std::collections::HashSet;

use tracing::debug;

use crate::error::BridgeError;
use crate::messages::EntitySnapshot;
use crate::registry::{EntityFactory, EntityRegistry, Kinematics};

/// Pure partition of a snapshot against a known id set. Useful for auditing
/// and tests; [`apply`] performs the same split while mutating the registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    /// Snapshot ids with no local representation, in snapshot order.
    pub to_create: Vec<String>,
    /// Snapshot ids already represented, in snapshot order.
    pub to_update: Vec<String>,
    /// Known ids absent from the snapshot, in id order.
    pub to_destroy: Vec<String>,
}

impl ReconcilePlan {
    pub fn compute<'a, I>(known: I, snapshot: &[EntitySnapshot]) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut remaining: HashSet<&str> = known.into_iter().collect();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut plan = Self::default();

        for entity in snapshot {
            let id = entity.entity_id.as_str();
            // Duplicate ids violate snapshot uniqueness; first occurrence wins.
            if !seen.insert(id) {
                continue;
            }
            if remaining.remove(id) {
                plan.to_update.push(id.to_string());
            } else {
                plan.to_create.push(id.to_string());
            }
        }

        plan.to_destroy = remaining.into_iter().map(String::from).collect();
        plan.to_destroy.sort();
        plan
    }
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub destroyed: Vec<String>,
}

impl ReconcileReport {
    /// True when the entity set itself changed, not just its states.
    pub fn lifecycle_changed(&self) -> bool {
        !self.created.is_empty() || !self.destroyed.is_empty()
    }
}

/// Converges `registry` to the snapshot's entity set.
pub fn apply(
    registry: &mut EntityRegistry,
    factory: &mut dyn EntityFactory,
    snapshot: &[EntitySnapshot],
) -> Result<ReconcileReport, BridgeError> {
    let mut unvisited: HashSet<String> = registry.ids().map(String::from).collect();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut report = ReconcileReport::default();

    for entity in snapshot {
        let id = entity.entity_id.as_str();
        if !seen.insert(id) {
            continue;
        }
        unvisited.remove(id);

        let kinematics = Kinematics::from(entity);
        if let Some(model) = registry.get_mut(id) {
            model.apply_kinematics(&kinematics);
            report.updated.push(id.to_string());
        } else {
            let Some(mut model) = factory.create(id, &entity.entity_kind, &kinematics) else {
                return Err(BridgeError::UnknownKind {
                    id: id.to_string(),
                    kind: entity.entity_kind.clone(),
                });
            };
            model.pre_initialize(&kinematics);
            registry.insert(id.to_string(), model);
            report.created.push(id.to_string());
        }
    }

    let mut leftovers: Vec<String> = unvisited.into_iter().collect();
    leftovers.sort();
    for id in leftovers {
        if let Some(model) = registry.remove(&id) {
            factory.destroy(&id, model);
            report.destroyed.push(id);
        }
    }

    if report.lifecycle_changed() {
        debug!(
            created = ?report.created,
            destroyed = ?report.destroyed,
            live = registry.len(),
            "entity set reconciled"
        );
    }
    Ok(report)
}
