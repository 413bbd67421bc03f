//! Steplink Core - Lock-Step Co-Simulation Bridge
//!
//! This library keeps an event-driven network simulator synchronized with an
//! external authoritative kinematics simulator. It solves three coupling
//! problems:
//! 1. **Time Coupling**: strict synchronous request/reply stepping, one
//!    outstanding exchange, per-exchange timeout scaling
//! 2. **Entity Coupling**: registry reconciliation that converges the local
//!    entity set to each authoritative snapshot
//! 3. **Payload Coupling**: opaque application relays that ride the same
//!    transport without the bridge interpreting a byte

pub mod config;
pub mod engine;
pub mod error;
pub mod messages;
pub mod mobility;
pub mod reconcile;
pub mod registry;
pub mod relay;
pub mod transport;

// Re-export key types for convenience
pub use config::{RunSettings, TransportConfig, DEFAULT_FLOOR_TIMEOUT};
pub use engine::{
    EnginePhase, StartOutcome, StepOutcome, SyncEngine, INIT_TIMEOUT_MULTIPLIER,
    STEP_TIMEOUT_MULTIPLIER,
};
pub use error::{BridgeError, RunEnd};
pub use messages::{
    EntityDecl, EntitySnapshot, ExchangeKind, Reply, Request, RunConfiguration, SimulationStatus,
};
pub use mobility::BasicMobility;
pub use reconcile::{ReconcilePlan, ReconcileReport};
pub use registry::{EntityFactory, EntityRegistry, Kinematics, MobilityModel};
pub use relay::{AppMessaging, RelayReply, GENERIC_TIMEOUT_MULTIPLIER};
pub use transport::{Link, LinkError, MemoryLink, Transport};

#[cfg(feature = "zeromq")]
pub use transport::ZmqLink;
