//! Entity representations and their registry.
//!
//! The bridge never owns entity behavior, it owns entity *lifecycles*. Two
//! traits form the seam:
//! - [`MobilityModel`]: one local representation of one authoritative entity,
//!   holding its latest kinematic state.
//! - [`EntityFactory`]: instantiates and tears down representations by kind.
//!
//! [`EntityRegistry`] is the single source of truth for which entities exist
//! locally. Reconciliation (see [`crate::reconcile`]) is the only writer
//! during a run; callers may pre-declare entities before the handshake.

use std::collections::HashMap;

use nalgebra::Vector3;
use serde_json::Value;

use crate::messages::{EntityDecl, EntitySnapshot};

// ============================================================================
// KINEMATIC STATE
// ============================================================================

/// Position, velocity and orientation of one entity at one instant.
///
/// `rotation` is `[pitch, yaw, roll]` in radians, matching the wire snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Kinematics {
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub rotation: Vector3<f64>,
}

impl Kinematics {
    pub fn new(position: Vector3<f64>, velocity: Vector3<f64>, rotation: Vector3<f64>) -> Self {
        Self {
            position,
            velocity,
            rotation,
        }
    }

    /// Stationary, axis-aligned state at the given position.
    pub fn at_rest(position: Vector3<f64>) -> Self {
        Self {
            position,
            velocity: Vector3::zeros(),
            rotation: Vector3::zeros(),
        }
    }

    /// Wire form of this state for the given entity.
    pub fn to_snapshot(&self, entity_id: &str, entity_kind: &str) -> EntitySnapshot {
        EntitySnapshot {
            entity_id: entity_id.to_string(),
            entity_kind: entity_kind.to_string(),
            position: [self.position.x, self.position.y, self.position.z],
            velocity: [self.velocity.x, self.velocity.y, self.velocity.z],
            rotation: [self.rotation.x, self.rotation.y, self.rotation.z],
        }
    }
}

impl From<&EntitySnapshot> for Kinematics {
    fn from(snapshot: &EntitySnapshot) -> Self {
        Self {
            position: Vector3::new(
                snapshot.position[0],
                snapshot.position[1],
                snapshot.position[2],
            ),
            velocity: Vector3::new(
                snapshot.velocity[0],
                snapshot.velocity[1],
                snapshot.velocity[2],
            ),
            rotation: Vector3::new(
                snapshot.rotation[0],
                snapshot.rotation[1],
                snapshot.rotation[2],
            ),
        }
    }
}

// ============================================================================
// COLLABORATOR TRAITS
// ============================================================================

/// Local representation of one authoritative entity.
///
/// Implementations expose the authoritative state plus locally derived
/// quantities (acceleration, angular rates) to the rest of the local
/// simulation. [`crate::mobility::BasicMobility`] is the reference
/// implementation.
pub trait MobilityModel: Send {
    /// Stable entity identifier, as used on the wire.
    fn id(&self) -> &str;

    /// Entity kind this representation was built for.
    fn kind(&self) -> &str;

    /// Free-form per-entity options announced in the handshake for
    /// pre-declared entities.
    fn configuration(&self) -> Value;

    /// One-time setup with the first authoritative state, called exactly once
    /// for dynamically created representations before any update.
    fn pre_initialize(&mut self, kinematics: &Kinematics);

    /// Adopts a fresh authoritative state.
    fn apply_kinematics(&mut self, kinematics: &Kinematics);

    fn position(&self) -> Vector3<f64>;
    fn velocity(&self) -> Vector3<f64>;
    fn acceleration(&self) -> Vector3<f64>;
    /// `[pitch, yaw, roll]` in radians.
    fn orientation(&self) -> Vector3<f64>;
    fn angular_velocity(&self) -> Vector3<f64>;
    fn angular_acceleration(&self) -> Vector3<f64>;
}

/// Builds and tears down entity representations.
///
/// `create` returns `None` for kinds this side cannot represent, which the
/// bridge treats as fatal. Returned models are not yet pre-initialized;
/// reconciliation calls [`MobilityModel::pre_initialize`] with the first
/// snapshot before registering the model.
pub trait EntityFactory: Send {
    /// Kinds this factory can instantiate, announced in the handshake.
    fn kinds(&self) -> Vec<String>;

    fn create(&mut self, id: &str, kind: &str, initial: &Kinematics)
        -> Option<Box<dyn MobilityModel>>;

    /// Teardown hook. Ownership of the model transfers here; dropping it is
    /// the release.
    fn destroy(&mut self, id: &str, model: Box<dyn MobilityModel>);
}

// ============================================================================
// REGISTRY
// ============================================================================

/// The set of live local representations, keyed by entity id.
#[derive(Default)]
pub struct EntityRegistry {
    entities: HashMap<String, Box<dyn MobilityModel>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-declares an entity before the handshake. Returns the previous
    /// model if the id was already taken.
    pub fn register(&mut self, model: Box<dyn MobilityModel>) -> Option<Box<dyn MobilityModel>> {
        self.entities.insert(model.id().to_string(), model)
    }

    pub fn get(&self, id: &str) -> Option<&dyn MobilityModel> {
        self.entities.get(id).map(|model| model.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Box<dyn MobilityModel>> {
        self.entities.get_mut(id)
    }

    pub(crate) fn insert(&mut self, id: String, model: Box<dyn MobilityModel>) {
        self.entities.insert(id, model);
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<Box<dyn MobilityModel>> {
        self.entities.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.entities.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &dyn MobilityModel)> + '_ {
        self.entities
            .iter()
            .map(|(id, model)| (id.as_str(), model.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Handshake declarations for every registered entity, in id order so the
    /// announced list is deterministic.
    pub fn declarations(&self) -> Vec<EntityDecl> {
        let mut declarations: Vec<EntityDecl> = self
            .entities
            .values()
            .map(|model| EntityDecl {
                entity_id: model.id().to_string(),
                entity_kind: model.kind().to_string(),
                configuration: model.configuration(),
            })
            .collect();
        declarations.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        declarations
    }
}
