//! Lock-step synchronization engine.
//!
//! [`SyncEngine`] drives the protocol through its phases:
//!
//! ```text
//!   Uninitialized --start()--> Handshaking --INIT_COMPLETED--> Stepping
//!        |                         |                              |
//!        |                         |                        step() loop
//!        |                         v                              v
//!        +----------------->  Terminated  <-----------------------+
//!                    (any failure, or cooperative FINISHED_*)
//! ```
//!
//! Termination is absorbing: once `Terminated`, every further operation
//! returns [`BridgeError::InvalidPhase`] without touching the wire. Transport,
//! protocol and reconciliation failures all land there; so does cooperative
//! termination, which is reported through the outcome types rather than as an
//! error.
//!
//! Usage:
//! ```ignore
//! let mut engine = SyncEngine::new(transport, factory, settings);
//! let offset = match engine.start(Duration::ZERO)? {
//!     StartOutcome::Ready { initial_offset, .. } => initial_offset,
//!     StartOutcome::Finished(end) => return Ok(end),
//! };
//! let mut clock = offset;
//! loop {
//!     match engine.step(clock)? {
//!         StepOutcome::Running { next_step_in, .. } => clock += next_step_in,
//!         StepOutcome::Finished(end) => return Ok(end),
//!     }
//! }
//! ```

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::RunSettings;
use crate::error::{BridgeError, RunEnd};
use crate::messages::{EntitySnapshot, ExchangeKind, Reply, Request, SimulationStatus};
use crate::reconcile::{self, ReconcileReport};
use crate::registry::{EntityFactory, EntityRegistry, MobilityModel};
use crate::relay::RelayReply;
use crate::transport::Transport;

/// Handshake replies may wait on world construction and asset loading.
pub const INIT_TIMEOUT_MULTIPLIER: f64 = 100.0;
/// Steps are the hot path and get the base timeout.
pub const STEP_TIMEOUT_MULTIPLIER: f64 = 1.0;

/// Where the engine is in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Uninitialized,
    Handshaking,
    Stepping,
    Terminated,
}

/// Result of a successful [`SyncEngine::start`].
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// Handshake accepted; schedule the first tick `initial_offset` from now.
    Ready {
        initial_offset: Duration,
        report: ReconcileReport,
    },
    /// The authoritative side declared the run over during the handshake.
    Finished(RunEnd),
}

/// Result of a successful [`SyncEngine::step`].
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// World advanced; schedule the next tick `next_step_in` from now.
    Running {
        next_step_in: Duration,
        report: ReconcileReport,
    },
    /// The authoritative side declared the run over.
    Finished(RunEnd),
}

pub(crate) enum Flow {
    Continue,
    Finish(RunEnd),
}

/// Owns the transport, the registry and the protocol state for one run.
pub struct SyncEngine {
    transport: Transport,
    factory: Box<dyn EntityFactory>,
    registry: EntityRegistry,
    settings: RunSettings,
    phase: EnginePhase,
    /// Local simulated time of the last operation; generic relays within the
    /// tick reuse it as their timestamp.
    clock: Duration,
    initial_offset: Option<Duration>,
}

impl SyncEngine {
    pub fn new(transport: Transport, factory: Box<dyn EntityFactory>, settings: RunSettings) -> Self {
        Self {
            transport,
            factory,
            registry: EntityRegistry::new(),
            settings,
            phase: EnginePhase::Uninitialized,
            clock: Duration::ZERO,
            initial_offset: None,
        }
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Offset to the first tick, once the handshake has completed.
    pub fn initial_offset(&self) -> Option<Duration> {
        self.initial_offset
    }

    /// Registers an entity that exists before the handshake, so the
    /// authoritative side can adopt it. Only valid while `Uninitialized`.
    pub fn declare_entity(&mut self, model: Box<dyn MobilityModel>) -> Result<(), BridgeError> {
        if self.phase != EnginePhase::Uninitialized {
            return Err(BridgeError::InvalidPhase {
                operation: "declare_entity",
                phase: self.phase,
            });
        }
        debug!(id = model.id(), kind = model.kind(), "entity pre-declared");
        if let Some(displaced) = self.registry.register(model) {
            warn!(id = displaced.id(), "pre-declared entity replaced");
        }
        Ok(())
    }

    /// Opens the run: announces settings, declared entities and buildable
    /// kinds, then adopts the authoritative initial snapshot.
    pub fn start(&mut self, now: Duration) -> Result<StartOutcome, BridgeError> {
        if self.phase != EnginePhase::Uninitialized {
            return Err(BridgeError::InvalidPhase {
                operation: "start",
                phase: self.phase,
            });
        }
        self.phase = EnginePhase::Handshaking;
        self.clock = now;

        let request = Request::Init {
            timestamp: now.as_secs_f64(),
            run_id: self.settings.run_id.clone(),
            run_configuration: self.settings.wire_configuration(),
            entities: self.registry.declarations(),
            user_defined: self.settings.extra_init.clone(),
            entity_kinds: self.factory.kinds(),
        };
        debug!(
            run_id = %self.settings.run_id,
            declared = self.registry.len(),
            "opening handshake"
        );
        let reply = self.round_trip(&request, INIT_TIMEOUT_MULTIPLIER)?;

        let (status, initial_timestamp, entities) = match reply {
            Reply::InitCompleted {
                simulation_status,
                initial_timestamp,
                entities,
            } => (simulation_status, initial_timestamp, entities),
            other => {
                return Err(self.fatal(protocol_error(
                    ExchangeKind::Init,
                    format!("unexpected {} reply shape", other.kind()),
                )))
            }
        };

        if let Flow::Finish(end) = self.interpret_status(ExchangeKind::Init, status)? {
            return Ok(StartOutcome::Finished(end));
        }
        let report = self.apply_snapshot(&entities)?;

        let initial_offset = match Duration::try_from_secs_f64(initial_timestamp) {
            Ok(offset) => offset,
            Err(_) => {
                return Err(self.fatal(protocol_error(
                    ExchangeKind::Init,
                    format!("invalid initial timestamp {initial_timestamp}"),
                )))
            }
        };
        self.initial_offset = Some(initial_offset);
        self.phase = EnginePhase::Stepping;
        info!(
            run_id = %self.settings.run_id,
            offset_s = initial_offset.as_secs_f64(),
            entities = self.registry.len(),
            "handshake complete"
        );
        Ok(StartOutcome::Ready {
            initial_offset,
            report,
        })
    }

    /// Advances the authoritative world by one step and reconciles the
    /// registry against the returned snapshot.
    pub fn step(&mut self, now: Duration) -> Result<StepOutcome, BridgeError> {
        if self.phase != EnginePhase::Stepping {
            return Err(BridgeError::InvalidPhase {
                operation: "step",
                phase: self.phase,
            });
        }
        self.clock = now;

        let request = Request::Step {
            timestamp: now.as_secs_f64(),
            step_size: self.settings.step_size.as_secs_f64(),
        };
        let reply = self.round_trip(&request, STEP_TIMEOUT_MULTIPLIER)?;

        let (status, entities) = match reply {
            Reply::Updated {
                simulation_status,
                entities,
            } => (simulation_status, entities),
            other => {
                return Err(self.fatal(protocol_error(
                    ExchangeKind::Step,
                    format!("unexpected {} reply shape", other.kind()),
                )))
            }
        };

        if let Flow::Finish(end) = self.interpret_status(ExchangeKind::Step, status)? {
            return Ok(StepOutcome::Finished(end));
        }
        let report = self.apply_snapshot(&entities)?;
        Ok(StepOutcome::Running {
            next_step_in: self.settings.step_size,
            report,
        })
    }

    /// Raw generic exchange shared by the [`crate::relay::AppMessaging`]
    /// surface. Valid only while `Stepping`.
    pub(crate) fn passthrough(
        &mut self,
        world: bool,
        payload: Value,
        multiplier: f64,
    ) -> Result<RelayReply, BridgeError> {
        let operation = if world { "call_world" } else { "call" };
        if self.phase != EnginePhase::Stepping {
            return Err(BridgeError::InvalidPhase {
                operation,
                phase: self.phase,
            });
        }

        let timestamp = self.clock.as_secs_f64();
        let request = if world {
            Request::WorldGeneric {
                timestamp,
                user_defined: payload,
            }
        } else {
            Request::Generic {
                timestamp,
                user_defined: payload,
            }
        };
        let exchange = request.kind();
        let reply = self.round_trip(&request, multiplier)?;

        let (status, user_defined) = match reply {
            Reply::Generic {
                simulation_status,
                user_defined,
            }
            | Reply::WorldGeneric {
                simulation_status,
                user_defined,
            } => (simulation_status, user_defined),
            other => {
                return Err(self.fatal(protocol_error(
                    exchange,
                    format!("unexpected {} reply shape", other.kind()),
                )))
            }
        };

        match self.interpret_status(exchange, status)? {
            Flow::Continue => Ok(RelayReply::Payload(user_defined)),
            Flow::Finish(end) => Ok(RelayReply::Finished(end)),
        }
    }

    fn round_trip(&mut self, request: &Request, multiplier: f64) -> Result<Reply, BridgeError> {
        match self.transport.exchange(request, multiplier) {
            Ok(reply) => Ok(reply),
            Err(err) => Err(self.fatal(err)),
        }
    }

    fn apply_snapshot(&mut self, entities: &[EntitySnapshot]) -> Result<ReconcileReport, BridgeError> {
        match reconcile::apply(&mut self.registry, self.factory.as_mut(), entities) {
            Ok(report) => Ok(report),
            Err(err) => Err(self.fatal(err)),
        }
    }

    /// Routes a reply status: `Running` flows on, `FINISHED_*` terminates
    /// cooperatively, the error code terminates fatally.
    fn interpret_status(
        &mut self,
        exchange: ExchangeKind,
        status: SimulationStatus,
    ) -> Result<Flow, BridgeError> {
        let end = match status {
            SimulationStatus::Running => return Ok(Flow::Continue),
            SimulationStatus::Error => {
                return Err(self.fatal(protocol_error(
                    exchange,
                    "authoritative simulator reported simulation_status -1".to_string(),
                )))
            }
            SimulationStatus::FinishedOk => RunEnd::FinishedOk,
            SimulationStatus::FinishedAccident => RunEnd::FinishedAccident,
            SimulationStatus::FinishedTimeLimit => RunEnd::FinishedTimeLimit,
        };
        self.phase = EnginePhase::Terminated;
        info!(%exchange, end = %end, "authoritative simulator ended the run");
        Ok(Flow::Finish(end))
    }

    fn fatal(&mut self, err: BridgeError) -> BridgeError {
        self.phase = EnginePhase::Terminated;
        error!(%err, "bridge failure, synchronization abandoned");
        err
    }
}

fn protocol_error(exchange: ExchangeKind, reason: String) -> BridgeError {
    BridgeError::ProtocolError { exchange, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::messages::{self, EntitySnapshot};
    use crate::mobility::BasicMobility;
    use crate::registry::Kinematics;
    use crate::transport::{Link, MemoryLink};
    use nalgebra::Vector3;
    use std::thread::JoinHandle;

    const STEP: Duration = Duration::from_millis(100);

    struct TestFactory {
        allowed: Vec<String>,
    }

    impl TestFactory {
        fn cars() -> Self {
            Self {
                allowed: vec!["car".to_string()],
            }
        }
    }

    impl EntityFactory for TestFactory {
        fn kinds(&self) -> Vec<String> {
            self.allowed.clone()
        }

        fn create(
            &mut self,
            id: &str,
            kind: &str,
            _initial: &Kinematics,
        ) -> Option<Box<dyn MobilityModel>> {
            if self.allowed.iter().any(|k| k == kind) {
                Some(Box::new(BasicMobility::new(id, kind, STEP)))
            } else {
                None
            }
        }

        fn destroy(&mut self, _id: &str, _model: Box<dyn MobilityModel>) {}
    }

    fn snap(id: &str, px: f64) -> EntitySnapshot {
        snap_kind(id, "car", px)
    }

    fn snap_kind(id: &str, kind: &str, px: f64) -> EntitySnapshot {
        Kinematics::at_rest(Vector3::new(px, 0.0, 0.0)).to_snapshot(id, kind)
    }

    fn init_reply(entities: Vec<EntitySnapshot>) -> Reply {
        Reply::InitCompleted {
            simulation_status: SimulationStatus::Running,
            initial_timestamp: 0.25,
            entities,
        }
    }

    fn updated(status: SimulationStatus, entities: Vec<EntitySnapshot>) -> Reply {
        Reply::Updated {
            simulation_status: status,
            entities,
        }
    }

    /// Engine wired to a canned peer that answers each request with the next
    /// scripted reply, then hangs up. Returns the requests the peer saw.
    fn engine_with_peer(replies: Vec<Reply>) -> (SyncEngine, JoinHandle<Vec<Request>>) {
        let (client, mut server) = MemoryLink::pair();
        let config = TransportConfig {
            timeout: Duration::from_millis(50),
            floor_timeout: Duration::from_millis(25),
            ..TransportConfig::default()
        };
        let engine = SyncEngine::new(
            Transport::new(Box::new(client), &config),
            Box::new(TestFactory::cars()),
            RunSettings {
                step_size: STEP,
                ..RunSettings::default()
            },
        );
        let peer = std::thread::spawn(move || {
            let mut seen = Vec::new();
            for reply in replies {
                match server.recv_timeout(Duration::from_secs(2)) {
                    Ok(frame) => {
                        seen.push(messages::decode_request(&frame).unwrap());
                        server
                            .send(&messages::encode_reply(&reply).unwrap())
                            .unwrap();
                    }
                    Err(_) => break,
                }
            }
            seen
        });
        (engine, peer)
    }

    #[test]
    fn test_handshake_adopts_initial_snapshot() {
        let (mut engine, peer) =
            engine_with_peer(vec![init_reply(vec![snap("v1", 1.0), snap("v2", 2.0)])]);
        engine
            .declare_entity(Box::new(BasicMobility::new("ego", "car", STEP)))
            .unwrap();

        match engine.start(Duration::ZERO).unwrap() {
            StartOutcome::Ready {
                initial_offset,
                report,
            } => {
                assert_eq!(initial_offset, Duration::from_millis(250));
                assert_eq!(report.created, vec!["v1", "v2"]);
                // The snapshot is authoritative; the pre-declared ego was
                // absent from it.
                assert_eq!(report.destroyed, vec!["ego"]);
            }
            other => panic!("expected ready, got {other:?}"),
        }
        assert_eq!(engine.phase(), EnginePhase::Stepping);
        assert_eq!(engine.initial_offset(), Some(Duration::from_millis(250)));
        assert_eq!(engine.registry().len(), 2);
        assert!(!engine.registry().contains("ego"));

        drop(engine);
        let seen = peer.join().unwrap();
        match &seen[0] {
            Request::Init {
                run_id,
                run_configuration,
                entities,
                entity_kinds,
                ..
            } => {
                assert_eq!(run_id, "steplink-run");
                assert_eq!(run_configuration.seed, 42);
                assert_eq!(entities.len(), 1);
                assert_eq!(entities[0].entity_id, "ego");
                assert_eq!(entity_kinds, &vec!["car".to_string()]);
            }
            other => panic!("expected init request, got {other:?}"),
        }
    }

    #[test]
    fn test_step_reconciles_churn() {
        let (mut engine, peer) = engine_with_peer(vec![
            init_reply(vec![snap("v1", 0.0)]),
            updated(
                SimulationStatus::Running,
                vec![snap("v1", 1.0), snap("v2", 5.0)],
            ),
            updated(SimulationStatus::Running, vec![snap("v2", 6.0)]),
        ]);

        engine.start(Duration::ZERO).unwrap();

        match engine.step(Duration::from_millis(250)).unwrap() {
            StepOutcome::Running {
                next_step_in,
                report,
            } => {
                assert_eq!(next_step_in, STEP);
                assert_eq!(report.created, vec!["v2"]);
                assert_eq!(report.updated, vec!["v1"]);
            }
            other => panic!("expected running, got {other:?}"),
        }

        match engine.step(Duration::from_millis(350)).unwrap() {
            StepOutcome::Running { report, .. } => {
                assert_eq!(report.destroyed, vec!["v1"]);
            }
            other => panic!("expected running, got {other:?}"),
        }
        assert!(engine.registry().contains("v2"));
        assert!(!engine.registry().contains("v1"));

        drop(engine);
        peer.join().unwrap();
    }

    #[test]
    fn test_step_timestamps_advance_on_wire() {
        let (mut engine, peer) = engine_with_peer(vec![
            init_reply(vec![]),
            updated(SimulationStatus::Running, vec![]),
            updated(SimulationStatus::Running, vec![]),
        ]);
        engine.start(Duration::ZERO).unwrap();
        engine.step(Duration::from_millis(250)).unwrap();
        engine.step(Duration::from_millis(350)).unwrap();
        drop(engine);

        let seen = peer.join().unwrap();
        let stamps: Vec<f64> = seen
            .iter()
            .filter_map(|request| match request {
                Request::Step { timestamp, .. } => Some(*timestamp),
                _ => None,
            })
            .collect();
        assert_eq!(stamps, vec![0.25, 0.35]);
    }

    #[test]
    fn test_finished_during_handshake() {
        let (mut engine, peer) = engine_with_peer(vec![Reply::InitCompleted {
            simulation_status: SimulationStatus::FinishedTimeLimit,
            initial_timestamp: 0.0,
            entities: vec![],
        }]);

        match engine.start(Duration::ZERO).unwrap() {
            StartOutcome::Finished(end) => assert_eq!(end, RunEnd::FinishedTimeLimit),
            other => panic!("expected finished, got {other:?}"),
        }
        assert_eq!(engine.phase(), EnginePhase::Terminated);
        drop(engine);
        peer.join().unwrap();
    }

    #[test]
    fn test_finished_mid_run_keeps_registry() {
        let (mut engine, peer) = engine_with_peer(vec![
            init_reply(vec![snap("v1", 0.0)]),
            // Terminal reply: its (empty) entity list must not trigger
            // destruction.
            updated(SimulationStatus::FinishedOk, vec![]),
        ]);
        engine.start(Duration::ZERO).unwrap();

        match engine.step(Duration::from_millis(250)).unwrap() {
            StepOutcome::Finished(end) => assert_eq!(end, RunEnd::FinishedOk),
            other => panic!("expected finished, got {other:?}"),
        }
        assert_eq!(engine.phase(), EnginePhase::Terminated);
        assert!(engine.registry().contains("v1"));

        // Termination is absorbing.
        assert!(matches!(
            engine.step(Duration::from_millis(350)),
            Err(BridgeError::InvalidPhase {
                operation: "step",
                ..
            })
        ));
        drop(engine);
        peer.join().unwrap();
    }

    #[test]
    fn test_error_status_is_fatal() {
        let (mut engine, peer) = engine_with_peer(vec![
            init_reply(vec![]),
            updated(SimulationStatus::Error, vec![]),
        ]);
        engine.start(Duration::ZERO).unwrap();

        match engine.step(Duration::from_millis(250)) {
            Err(BridgeError::ProtocolError { exchange, reason }) => {
                assert_eq!(exchange, ExchangeKind::Step);
                assert!(reason.contains("-1"));
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
        assert_eq!(engine.phase(), EnginePhase::Terminated);
        drop(engine);
        peer.join().unwrap();
    }

    #[test]
    fn test_step_timeout_terminates() {
        let (client, mut server) = MemoryLink::pair();
        let config = TransportConfig {
            timeout: Duration::from_millis(40),
            floor_timeout: Duration::from_millis(20),
            ..TransportConfig::default()
        };
        let mut engine = SyncEngine::new(
            Transport::new(Box::new(client), &config),
            Box::new(TestFactory::cars()),
            RunSettings::default(),
        );

        // Peer answers the handshake, then goes silent while staying
        // connected.
        let peer = std::thread::spawn(move || {
            let frame = server.recv_timeout(Duration::from_secs(2)).unwrap();
            assert!(matches!(
                messages::decode_request(&frame).unwrap(),
                Request::Init { .. }
            ));
            server
                .send(&messages::encode_reply(&init_reply(vec![])).unwrap())
                .unwrap();
            // Swallow the step request, then hold the link open past the
            // step deadline; an early hangup reads as a closed link, not a
            // timeout.
            let _ = server.recv_timeout(Duration::from_secs(2));
            std::thread::sleep(Duration::from_millis(200));
        });

        engine.start(Duration::ZERO).unwrap();
        assert!(matches!(
            engine.step(Duration::from_millis(250)),
            Err(BridgeError::TransportTimeout {
                exchange: ExchangeKind::Step
            })
        ));
        assert_eq!(engine.phase(), EnginePhase::Terminated);

        // No further wire traffic is attempted.
        assert!(matches!(
            engine.step(Duration::from_millis(350)),
            Err(BridgeError::InvalidPhase { .. })
        ));
        drop(engine);
        peer.join().unwrap();
    }

    #[test]
    fn test_unknown_kind_terminates_without_destroys() {
        let (mut engine, peer) = engine_with_peer(vec![
            init_reply(vec![snap("v1", 0.0)]),
            updated(
                SimulationStatus::Running,
                vec![snap_kind("ghost", "hovercraft", 0.0)],
            ),
        ]);
        engine.start(Duration::ZERO).unwrap();

        assert!(matches!(
            engine.step(Duration::from_millis(250)),
            Err(BridgeError::UnknownKind { .. })
        ));
        assert_eq!(engine.phase(), EnginePhase::Terminated);
        // v1 was absent from the failing snapshot but survives it.
        assert!(engine.registry().contains("v1"));
        drop(engine);
        peer.join().unwrap();
    }

    #[test]
    fn test_negative_initial_timestamp_rejected() {
        let (mut engine, peer) = engine_with_peer(vec![Reply::InitCompleted {
            simulation_status: SimulationStatus::Running,
            initial_timestamp: -0.5,
            entities: vec![],
        }]);

        assert!(matches!(
            engine.start(Duration::ZERO),
            Err(BridgeError::ProtocolError {
                exchange: ExchangeKind::Init,
                ..
            })
        ));
        assert_eq!(engine.phase(), EnginePhase::Terminated);
        drop(engine);
        peer.join().unwrap();
    }

    #[test]
    fn test_declare_entity_rejected_after_start() {
        let (mut engine, peer) = engine_with_peer(vec![init_reply(vec![])]);
        engine.start(Duration::ZERO).unwrap();
        assert!(matches!(
            engine.declare_entity(Box::new(BasicMobility::new("late", "car", STEP))),
            Err(BridgeError::InvalidPhase {
                operation: "declare_entity",
                ..
            })
        ));
        drop(engine);
        peer.join().unwrap();
    }

    #[test]
    fn test_start_twice_rejected() {
        let (mut engine, peer) = engine_with_peer(vec![init_reply(vec![])]);
        engine.start(Duration::ZERO).unwrap();
        assert!(matches!(
            engine.start(Duration::ZERO),
            Err(BridgeError::InvalidPhase {
                operation: "start",
                ..
            })
        ));
        // The failed call did not disturb the run.
        assert_eq!(engine.phase(), EnginePhase::Stepping);
        drop(engine);
        peer.join().unwrap();
    }
}
