//! Local-simulator side of the harness.
//!
//! [`BridgeHost`] plays the event-driven network simulator: it owns a
//! [`SyncEngine`], a virtual clock that jumps tick to tick, and an optional
//! application probe that exercises the relay surface mid-run. Entity
//! representations are built by [`BlueprintFactory`] from kind → blueprint
//! mappings, the way a node would be picked from a module catalogue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use steplink_core::{
    AppMessaging, BasicMobility, BridgeError, EntityFactory, Kinematics, MobilityModel, RelayReply,
    RunEnd, RunSettings, StartOutcome, StepOutcome, SyncEngine, Transport,
    GENERIC_TIMEOUT_MULTIPLIER,
};

/// Stable run identifier derived from the master seed.
pub fn derive_run_id(seed: u64) -> String {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&seed.to_le_bytes());
    bytes[8..].copy_from_slice(&seed.wrapping_mul(0x9e3779b97f4a7c15).to_le_bytes());
    uuid::Uuid::from_bytes(bytes).to_string()
}

// ============================================================================
// BLUEPRINT FACTORY
// ============================================================================

/// How to represent one entity kind locally.
#[derive(Debug, Clone)]
pub struct NodeBlueprint {
    /// Node module to instantiate, e.g. `steplink.node.Car`.
    pub module: String,
    /// Instance slot pattern; `*` is replaced by the entity id.
    pub slot: String,
    /// Per-entity options announced for pre-declared entities.
    pub configuration: Value,
}

impl NodeBlueprint {
    pub fn new(module: impl Into<String>, slot: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            slot: slot.into(),
            configuration: Value::Null,
        }
    }

    pub fn with_configuration(mut self, configuration: Value) -> Self {
        self.configuration = configuration;
        self
    }

    fn instance_name(&self, id: &str) -> String {
        self.slot.replace('*', id)
    }
}

/// Creation/teardown trail, shared out of the factory so it can be read after
/// the engine has consumed the factory.
#[derive(Debug, Clone, Default)]
pub struct FactoryAudit {
    pub created: Vec<String>,
    pub destroyed: Vec<String>,
}

/// [`EntityFactory`] over a kind → blueprint catalogue, producing
/// [`BasicMobility`] nodes.
pub struct BlueprintFactory {
    step_size: Duration,
    blueprints: HashMap<String, NodeBlueprint>,
    audit: Arc<Mutex<FactoryAudit>>,
}

impl BlueprintFactory {
    pub fn new(step_size: Duration) -> Self {
        Self {
            step_size,
            blueprints: HashMap::new(),
            audit: Arc::new(Mutex::new(FactoryAudit::default())),
        }
    }

    pub fn with_blueprint(mut self, kind: impl Into<String>, blueprint: NodeBlueprint) -> Self {
        self.blueprints.insert(kind.into(), blueprint);
        self
    }

    /// Handle to the creation/teardown trail.
    pub fn audit(&self) -> Arc<Mutex<FactoryAudit>> {
        Arc::clone(&self.audit)
    }

    /// Builds a node the way `create` does, for pre-declaration.
    pub fn node(&self, id: &str, kind: &str) -> Option<Box<dyn MobilityModel>> {
        let blueprint = self.blueprints.get(kind)?;
        Some(Box::new(
            BasicMobility::new(id, kind, self.step_size)
                .with_configuration(blueprint.configuration.clone()),
        ))
    }
}

impl EntityFactory for BlueprintFactory {
    fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.blueprints.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    fn create(
        &mut self,
        id: &str,
        kind: &str,
        _initial: &Kinematics,
    ) -> Option<Box<dyn MobilityModel>> {
        let blueprint = self.blueprints.get(kind)?;
        debug!(
            module = %blueprint.module,
            instance = %blueprint.instance_name(id),
            "node spawned"
        );
        self.audit
            .lock()
            .expect("factory audit lock poisoned")
            .created
            .push(id.to_string());
        Some(Box::new(
            BasicMobility::new(id, kind, self.step_size)
                .with_configuration(blueprint.configuration.clone()),
        ))
    }

    fn destroy(&mut self, id: &str, model: Box<dyn MobilityModel>) {
        debug!(id, kind = model.kind(), "node torn down");
        self.audit
            .lock()
            .expect("factory audit lock poisoned")
            .destroyed
            .push(id.to_string());
        drop(model);
    }
}

// ============================================================================
// BRIDGE HOST
// ============================================================================

/// Relay exercised every `every` steps with a fixed payload.
#[derive(Debug, Clone)]
pub struct AppProbe {
    pub every: u64,
    pub payload: Value,
}

/// What one hosted run produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// Completed synchronization ticks.
    pub steps: u64,
    /// Cooperative termination, if the run reached one.
    pub end: Option<RunEnd>,
    /// Fatal bridge failure, if one occurred.
    pub error: Option<String>,
    /// Hit the step ceiling before any termination.
    pub truncated: bool,
    /// Virtual clock at the end, in simulated seconds.
    pub final_time: f64,
    pub entities_created: Vec<String>,
    pub entities_destroyed: Vec<String>,
    /// Registry content at the end, in id order.
    pub live_entities: Vec<String>,
    /// Successful relay round trips the probe made.
    pub relay_replies: u64,
}

/// Drives one run to completion over a virtual clock.
pub struct BridgeHost {
    engine: SyncEngine,
    audit: Arc<Mutex<FactoryAudit>>,
    max_steps: u64,
    probe: Option<AppProbe>,
}

impl BridgeHost {
    pub fn new(transport: Transport, factory: BlueprintFactory, settings: RunSettings) -> Self {
        let audit = factory.audit();
        Self {
            engine: SyncEngine::new(transport, Box::new(factory), settings),
            audit,
            max_steps: 10_000,
            probe: None,
        }
    }

    /// Safety ceiling for unbounded scenarios.
    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_probe(mut self, probe: AppProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Pre-declares an entity before the handshake.
    pub fn declare(&mut self, model: Box<dyn MobilityModel>) -> Result<(), BridgeError> {
        self.engine.declare_entity(model)
    }

    pub fn run(mut self) -> RunReport {
        let mut clock = Duration::ZERO;
        let mut steps = 0u64;
        let mut end: Option<RunEnd> = None;
        let mut error: Option<String> = None;
        let mut truncated = false;
        let mut relay_replies = 0u64;

        match self.engine.start(clock) {
            Ok(StartOutcome::Ready { initial_offset, .. }) => {
                clock += initial_offset;
                loop {
                    if steps >= self.max_steps {
                        warn!(steps, "step ceiling reached, abandoning run");
                        truncated = true;
                        break;
                    }
                    match self.engine.step(clock) {
                        Ok(StepOutcome::Running { next_step_in, .. }) => {
                            steps += 1;
                            clock += next_step_in;

                            let probe_payload = self
                                .probe
                                .as_ref()
                                .filter(|probe| probe.every > 0 && steps % probe.every == 0)
                                .map(|probe| probe.payload.clone());
                            if let Some(payload) = probe_payload {
                                match self.engine.call(payload, GENERIC_TIMEOUT_MULTIPLIER) {
                                    Ok(RelayReply::Payload(_)) => relay_replies += 1,
                                    Ok(RelayReply::Finished(e)) => {
                                        end = Some(e);
                                        break;
                                    }
                                    Err(e) => {
                                        error = Some(e.to_string());
                                        break;
                                    }
                                }
                            }
                        }
                        Ok(StepOutcome::Finished(e)) => {
                            end = Some(e);
                            break;
                        }
                        Err(e) => {
                            error = Some(e.to_string());
                            break;
                        }
                    }
                }
            }
            Ok(StartOutcome::Finished(e)) => end = Some(e),
            Err(e) => error = Some(e.to_string()),
        }

        let audit = self.audit.lock().expect("factory audit lock poisoned");
        let mut live_entities: Vec<String> =
            self.engine.registry().ids().map(String::from).collect();
        live_entities.sort();

        let report = RunReport {
            steps,
            end,
            error,
            truncated,
            final_time: clock.as_secs_f64(),
            entities_created: audit.created.clone(),
            entities_destroyed: audit.destroyed.clone(),
            live_entities,
            relay_replies,
        };
        info!(
            steps = report.steps,
            end = report.end.map(|e| e.name()).unwrap_or("none"),
            error = report.error.as_deref().unwrap_or("none"),
            "run complete"
        );
        report
    }
}
