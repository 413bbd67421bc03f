//! Scripted ground-truth world.
//!
//! The world model is the mock authoritative simulator's "God's eye view":
//! it owns the true kinematics of every scripted entity and advances them
//! with constant-velocity physics. Entities carry spawn/despawn windows so
//! scenarios can exercise mid-run entity churn without bespoke server logic.

use nalgebra::Vector3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use steplink_core::messages::EntitySnapshot;

/// One scripted entity with its lifetime window.
#[derive(Debug, Clone)]
pub struct WorldEntity {
    pub id: String,
    pub kind: String,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    /// Simulated second the entity enters the world.
    pub spawn_at: f64,
    /// Simulated second the entity leaves again; `None` means never.
    pub despawn_at: Option<f64>,
}

impl WorldEntity {
    /// Entity present from the start, moving at constant velocity.
    pub fn cruising(
        id: impl Into<String>,
        kind: impl Into<String>,
        position: Vector3<f64>,
        velocity: Vector3<f64>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            position,
            velocity,
            spawn_at: 0.0,
            despawn_at: None,
        }
    }

    /// Restricts the entity to a lifetime window.
    pub fn window(mut self, spawn_at: f64, despawn_at: Option<f64>) -> Self {
        self.spawn_at = spawn_at;
        self.despawn_at = despawn_at;
        self
    }

    pub fn active_at(&self, time: f64) -> bool {
        time >= self.spawn_at && self.despawn_at.map_or(true, |until| time < until)
    }

    fn snapshot(&self) -> EntitySnapshot {
        // Yaw follows the direction of travel; stationary entities face +x.
        let speed = self.velocity.norm();
        let yaw = if speed > 1e-9 {
            self.velocity.y.atan2(self.velocity.x)
        } else {
            0.0
        };
        EntitySnapshot {
            entity_id: self.id.clone(),
            entity_kind: self.kind.clone(),
            position: [self.position.x, self.position.y, self.position.z],
            velocity: [self.velocity.x, self.velocity.y, self.velocity.z],
            rotation: [0.0, yaw, 0.0],
        }
    }
}

/// Ground truth for one scenario run.
pub struct WorldModel {
    entities: Vec<WorldEntity>,
    /// Completed ticks. `step` must be called with one fixed `dt` per run;
    /// simulated time is `ticks * dt`.
    ticks: u64,
    tick_size: f64,
    rng: ChaCha8Rng,
}

impl WorldModel {
    pub fn new(seed: u64) -> Self {
        Self {
            entities: Vec::new(),
            ticks: 0,
            tick_size: 0.0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn insert(&mut self, entity: WorldEntity) {
        self.entities.push(entity);
    }

    /// Scripts `count` cruisers of one kind with seeded random poses.
    pub fn populate_cruisers(&mut self, count: usize, kind: &str) {
        for index in 0..count {
            let position = Vector3::new(
                self.rng.gen_range(-200.0..200.0),
                self.rng.gen_range(-200.0..200.0),
                0.0,
            );
            let heading: f64 = self.rng.gen_range(-std::f64::consts::PI..std::f64::consts::PI);
            let speed = self.rng.gen_range(3.0..15.0);
            let velocity = Vector3::new(heading.cos() * speed, heading.sin() * speed, 0.0);
            self.insert(WorldEntity::cruising(
                format!("{kind}-{index}"),
                kind,
                position,
                velocity,
            ));
        }
    }

    /// Advances all currently active entities by `dt` seconds.
    pub fn step(&mut self, dt: f64) {
        let now = self.time();
        for entity in &mut self.entities {
            if entity.active_at(now) {
                entity.position += entity.velocity * dt;
            }
        }
        self.tick_size = dt;
        self.ticks += 1;
    }

    /// Simulated seconds elapsed, derived from the tick count so repeated
    /// stepping cannot drift below a tick boundary.
    pub fn time(&self) -> f64 {
        self.ticks as f64 * self.tick_size
    }

    /// Wire snapshots of the active entities, in script order.
    pub fn snapshot(&self) -> Vec<EntitySnapshot> {
        self.entities
            .iter()
            .filter(|entity| entity.active_at(self.time()))
            .map(WorldEntity::snapshot)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.entities
            .iter()
            .filter(|entity| entity.active_at(self.time()))
            .count()
    }
}
