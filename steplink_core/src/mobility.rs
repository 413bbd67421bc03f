//! Reference mobility model.
//!
//! [`BasicMobility`] holds the latest authoritative kinematics verbatim and
//! derives what the wire does not carry: acceleration and angular rates, via
//! finite differences over the configured step size. Entities that need
//! richer behavior (interpolation, sensor mounting offsets) implement
//! [`MobilityModel`] themselves; the bridge only cares about the trait.

use std::time::Duration;

use nalgebra::Vector3;
use serde_json::Value;

use crate::registry::{Kinematics, MobilityModel};

/// Sample-and-hold mobility: state jumps to each authoritative snapshot and
/// stays there until the next tick.
pub struct BasicMobility {
    id: String,
    kind: String,
    configuration: Value,
    step_size: Duration,
    kinematics: Kinematics,
    last_velocity: Vector3<f64>,
    angular_velocity: Vector3<f64>,
    last_angular_velocity: Vector3<f64>,
    pre_initialized: bool,
}

impl BasicMobility {
    /// At-rest model at the origin. `step_size` must be non-zero; it is the
    /// denominator of every derived rate.
    pub fn new(id: impl Into<String>, kind: impl Into<String>, step_size: Duration) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            configuration: Value::Null,
            step_size,
            kinematics: Kinematics::at_rest(Vector3::zeros()),
            last_velocity: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
            last_angular_velocity: Vector3::zeros(),
            pre_initialized: false,
        }
    }

    /// Attaches the per-entity options announced in the handshake.
    pub fn with_configuration(mut self, configuration: Value) -> Self {
        self.configuration = configuration;
        self
    }

    /// Places the model before the handshake, for pre-declared entities.
    pub fn with_initial(mut self, kinematics: Kinematics) -> Self {
        self.kinematics = kinematics;
        self.last_velocity = kinematics.velocity;
        self
    }

    /// Whether `pre_initialize` has run.
    pub fn is_pre_initialized(&self) -> bool {
        self.pre_initialized
    }

    fn dt(&self) -> f64 {
        self.step_size.as_secs_f64()
    }
}

impl MobilityModel for BasicMobility {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn configuration(&self) -> Value {
        self.configuration.clone()
    }

    fn pre_initialize(&mut self, kinematics: &Kinematics) {
        self.kinematics = *kinematics;
        self.last_velocity = kinematics.velocity;
        self.angular_velocity = Vector3::zeros();
        self.last_angular_velocity = Vector3::zeros();
        self.pre_initialized = true;
    }

    fn apply_kinematics(&mut self, kinematics: &Kinematics) {
        let dt = self.dt();
        self.last_velocity = self.kinematics.velocity;
        self.last_angular_velocity = self.angular_velocity;
        // Euler-rate estimate; a wrap across ±pi reads as a large rate for
        // one step.
        self.angular_velocity = (kinematics.rotation - self.kinematics.rotation) / dt;
        self.kinematics = *kinematics;
    }

    fn position(&self) -> Vector3<f64> {
        self.kinematics.position
    }

    fn velocity(&self) -> Vector3<f64> {
        self.kinematics.velocity
    }

    fn acceleration(&self) -> Vector3<f64> {
        (self.kinematics.velocity - self.last_velocity) / self.dt()
    }

    fn orientation(&self) -> Vector3<f64> {
        self.kinematics.rotation
    }

    fn angular_velocity(&self) -> Vector3<f64> {
        self.angular_velocity
    }

    fn angular_acceleration(&self) -> Vector3<f64> {
        (self.angular_velocity - self.last_angular_velocity) / self.dt()
    }
}
