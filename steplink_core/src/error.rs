//! Error taxonomy for the bridge.
//!
//! Every variant of [`BridgeError`] is fatal to the synchronized run: once the
//! engine surfaces one, it refuses further exchanges. Cooperative termination
//! (the authoritative side reporting that the run is over) is *not* an error
//! and is carried by [`RunEnd`] inside the engine's outcome types instead.

use serde::Serialize;
use thiserror::Error;

use crate::engine::EnginePhase;
use crate::messages::ExchangeKind;

/// Fatal bridge failures.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No reply arrived within the effective timeout for the exchange.
    #[error("{exchange} exchange timed out waiting for the authoritative reply")]
    TransportTimeout { exchange: ExchangeKind },

    /// The underlying link failed (socket error, peer gone, channel closed).
    #[error("{exchange} exchange failed at the transport layer: {reason}")]
    TransportError { exchange: ExchangeKind, reason: String },

    /// The reply was malformed, carried the wrong tag, or reported the
    /// authoritative error status.
    #[error("{exchange} exchange violated the protocol: {reason}")]
    ProtocolError { exchange: ExchangeKind, reason: String },

    /// A snapshot asked for an entity of a kind the factory cannot build.
    #[error("no representation configured for entity kind `{kind}` (entity `{id}`)")]
    UnknownKind { id: String, kind: String },

    /// An operation was invoked in a phase that does not permit it. The
    /// engine's phase is left unchanged by this error.
    #[error("`{operation}` called while the engine is {phase:?}")]
    InvalidPhase {
        operation: &'static str,
        phase: EnginePhase,
    },
}

/// Cooperative end of the run, as reported by the authoritative simulator.
///
/// These mirror the terminal `simulation_status` codes on the wire and are
/// deliberately kept out of [`BridgeError`]: a finished run is a result, not
/// a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEnd {
    /// The scenario ran to its scripted conclusion.
    FinishedOk,
    /// The authoritative simulator detected an accident and stopped.
    FinishedAccident,
    /// The configured time limit was reached.
    FinishedTimeLimit,
}

impl RunEnd {
    /// Stable lowercase name, used in logs and reports.
    pub fn name(&self) -> &'static str {
        match self {
            RunEnd::FinishedOk => "finished_ok",
            RunEnd::FinishedAccident => "finished_accident",
            RunEnd::FinishedTimeLimit => "finished_time_limit",
        }
    }
}

impl std::fmt::Display for RunEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
