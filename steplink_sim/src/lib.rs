//! # Steplink Sim
//!
//! Scenario harness for the lock-step bridge: a scripted authoritative world
//! served over an in-process link, a host that drives `steplink_core` through
//! the full protocol, and a set of scenarios that assert on the run report.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  INIT / STEP / GENERIC  ┌──────────────┐
//! │  BridgeHost │ ───────────────────────▶ │  WorldServer │
//! │ (SyncEngine │                          │ (WorldModel  │
//! │  + factory) │ ◀─────────────────────── │  + script)   │
//! └─────────────┘   snapshots / status     └──────────────┘
//!        │                                        │
//!        └────────── MemoryLink::pair() ──────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use steplink_sim::scenarios::{run_scenario, ScenarioId};
//!
//! let result = run_scenario(ScenarioId::Churn, 42);
//! assert!(result.passed, "{:?}", result.failure_reason);
//! println!("{} steps, end {:?}", result.report.steps, result.report.end);
//! ```

pub mod host;
pub mod scenarios;
pub mod server;
pub mod world;

pub use host::{derive_run_id, AppProbe, BlueprintFactory, BridgeHost, NodeBlueprint, RunReport};
pub use scenarios::{run_scenario, ScenarioId, ScenarioResult};
pub use server::{ServerScript, ServerStats, WorldServer};
pub use world::{WorldEntity, WorldModel};
