//! Bridge configuration.
//!
//! Two small structs cover the two tunable surfaces:
//! - [`TransportConfig`]: where the authoritative simulator listens and how
//!   patient the request/reply transport is.
//! - [`RunSettings`]: what the handshake announces about the run (identity,
//!   seed, step size, optional wall-clock limit, free-form extras).

use std::time::Duration;

use serde_json::Value;

use crate::messages::RunConfiguration;

/// Receive timeouts never drop below this unless explicitly overridden.
/// Interpreter-based authoritative simulators routinely pause for garbage
/// collection or asset loading, so the floor is generous.
pub const DEFAULT_FLOOR_TIMEOUT: Duration = Duration::from_secs(4);

/// Endpoint and timeout policy for the authoritative link.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Socket scheme, e.g. `tcp` or `ipc`.
    pub scheme: String,
    /// Host or path the authoritative simulator listens on.
    pub host: String,
    /// Port for socket schemes that use one.
    pub port: u16,
    /// Base receive timeout, scaled per exchange by its multiplier.
    pub timeout: Duration,
    /// Lower bound applied after scaling. See [`DEFAULT_FLOOR_TIMEOUT`].
    pub floor_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            scheme: "tcp".to_string(),
            host: "127.0.0.1".to_string(),
            port: 5555,
            timeout: Duration::from_secs(5),
            floor_timeout: DEFAULT_FLOOR_TIMEOUT,
        }
    }
}

impl TransportConfig {
    /// Full connect address, e.g. `tcp://127.0.0.1:5555`.
    pub fn endpoint(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Per-run parameters announced during the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    /// Identifier the authoritative side uses to select or label the run.
    pub run_id: String,
    /// Seed forwarded verbatim so both simulators can derive their streams
    /// from the same root.
    pub seed: u64,
    /// Simulated time between synchronization ticks.
    pub step_size: Duration,
    /// Simulated time budget for the whole run. `None` means unbounded.
    pub time_limit: Option<Duration>,
    /// Opaque payload forwarded untouched inside the handshake.
    pub extra_init: Value,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            run_id: "steplink-run".to_string(),
            seed: 42,
            step_size: Duration::from_millis(100),
            time_limit: None,
            extra_init: Value::Null,
        }
    }
}

impl RunSettings {
    /// Wire form of the run parameters. An absent time limit is encoded as
    /// `-1.0`, which the authoritative side reads as "unbounded".
    pub fn wire_configuration(&self) -> RunConfiguration {
        RunConfiguration {
            seed: self.seed,
            step_size: self.step_size.as_secs_f64(),
            time_limit: self
                .time_limit
                .map_or(-1.0, |limit| limit.as_secs_f64()),
        }
    }
}
