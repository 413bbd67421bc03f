//! Wire format of the synchronization protocol.
//!
//! Every exchange is a single JSON object in each direction, discriminated by
//! a `message_type` tag:
//!
//! ```text
//!   local simulator                      authoritative simulator
//!        |  INIT                   -->  |
//!        |  <--  INIT_COMPLETED         |
//!        |  SIMULATION_STEP        -->  |
//!        |  <--  UPDATED_POSITIONS      |
//!        |  GENERIC_MESSAGE        -->  |
//!        |  <--  GENERIC_RESPONSE       |
//!        |  WORLD_GENERIC_MESSAGE  -->  |
//!        |  <--  WORLD_GENERIC_RESPONSE |
//! ```
//!
//! Requests and replies are modeled as two internally tagged enums so that a
//! frame can only ever decode into one shape. Application payloads
//! (`user_defined`) stay opaque [`Value`]s end to end.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// SIMULATION STATUS
// ============================================================================

/// Authoritative run status carried by every reply.
///
/// Encoded as the numeric codes the protocol fixes: `0` running, `1/2/3`
/// cooperative termination, `-1` authoritative-side error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum SimulationStatus {
    Running,
    FinishedOk,
    FinishedAccident,
    FinishedTimeLimit,
    Error,
}

/// A reply carried a `simulation_status` code outside the protocol table.
#[derive(Debug, Error)]
#[error("unknown simulation status code {0}")]
pub struct UnknownStatus(pub i32);

impl SimulationStatus {
    /// Numeric wire code.
    pub fn code(&self) -> i32 {
        match self {
            SimulationStatus::Running => 0,
            SimulationStatus::FinishedOk => 1,
            SimulationStatus::FinishedAccident => 2,
            SimulationStatus::FinishedTimeLimit => 3,
            SimulationStatus::Error => -1,
        }
    }

    /// True for the three cooperative termination codes.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            SimulationStatus::FinishedOk
                | SimulationStatus::FinishedAccident
                | SimulationStatus::FinishedTimeLimit
        )
    }
}

impl TryFrom<i32> for SimulationStatus {
    type Error = UnknownStatus;

    fn try_from(code: i32) -> Result<Self, UnknownStatus> {
        match code {
            0 => Ok(SimulationStatus::Running),
            1 => Ok(SimulationStatus::FinishedOk),
            2 => Ok(SimulationStatus::FinishedAccident),
            3 => Ok(SimulationStatus::FinishedTimeLimit),
            -1 => Ok(SimulationStatus::Error),
            other => Err(UnknownStatus(other)),
        }
    }
}

impl From<SimulationStatus> for i32 {
    fn from(status: SimulationStatus) -> i32 {
        status.code()
    }
}

// ============================================================================
// EXCHANGE KINDS
// ============================================================================

/// The four request/reply exchange families, used for timeout policy and
/// error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Init,
    Step,
    Generic,
    WorldGeneric,
}

impl ExchangeKind {
    pub fn name(&self) -> &'static str {
        match self {
            ExchangeKind::Init => "init",
            ExchangeKind::Step => "step",
            ExchangeKind::Generic => "generic",
            ExchangeKind::WorldGeneric => "world-generic",
        }
    }
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// SHARED RECORDS
// ============================================================================

/// Run parameters inside the `INIT` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfiguration {
    pub seed: u64,
    /// Simulated seconds per synchronization tick.
    pub step_size: f64,
    /// Simulated-seconds budget for the run; negative means unbounded.
    pub time_limit: f64,
}

/// A locally pre-declared entity announced during the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDecl {
    pub entity_id: String,
    pub entity_kind: String,
    /// Free-form per-entity options, forwarded untouched.
    pub configuration: Value,
}

/// Authoritative kinematic state of one entity.
///
/// Vectors are `[x, y, z]` in meters and meters per second; `rotation` is
/// `[pitch, yaw, roll]` in radians.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_id: String,
    pub entity_kind: String,
    pub position: [f64; 3],
    pub velocity: [f64; 3],
    pub rotation: [f64; 3],
}

// ============================================================================
// REQUESTS AND REPLIES
// ============================================================================

/// Local-simulator → authoritative-simulator messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type")]
pub enum Request {
    /// Handshake: announces the run, pre-declared entities and the entity
    /// kinds this side can represent.
    #[serde(rename = "INIT")]
    Init {
        /// Local simulated time at which the handshake is issued.
        timestamp: f64,
        run_id: String,
        run_configuration: RunConfiguration,
        entities: Vec<EntityDecl>,
        /// Opaque application payload.
        user_defined: Value,
        /// Kinds the local entity factory can instantiate.
        entity_kinds: Vec<String>,
    },

    /// Advance the authoritative world by `step_size` simulated seconds.
    #[serde(rename = "SIMULATION_STEP")]
    Step { timestamp: f64, step_size: f64 },

    /// Application payload addressed to one authoritative-side application.
    #[serde(rename = "GENERIC_MESSAGE")]
    Generic { timestamp: f64, user_defined: Value },

    /// Application payload addressed to the authoritative world itself.
    #[serde(rename = "WORLD_GENERIC_MESSAGE")]
    WorldGeneric { timestamp: f64, user_defined: Value },
}

impl Request {
    /// Exchange family this request opens.
    pub fn kind(&self) -> ExchangeKind {
        match self {
            Request::Init { .. } => ExchangeKind::Init,
            Request::Step { .. } => ExchangeKind::Step,
            Request::Generic { .. } => ExchangeKind::Generic,
            Request::WorldGeneric { .. } => ExchangeKind::WorldGeneric,
        }
    }
}

/// Authoritative-simulator → local-simulator messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type")]
pub enum Reply {
    #[serde(rename = "INIT_COMPLETED")]
    InitCompleted {
        simulation_status: SimulationStatus,
        /// Simulated seconds until the first synchronization tick.
        initial_timestamp: f64,
        entities: Vec<EntitySnapshot>,
    },

    #[serde(rename = "UPDATED_POSITIONS")]
    Updated {
        simulation_status: SimulationStatus,
        entities: Vec<EntitySnapshot>,
    },

    #[serde(rename = "GENERIC_RESPONSE")]
    Generic {
        simulation_status: SimulationStatus,
        user_defined: Value,
    },

    #[serde(rename = "WORLD_GENERIC_RESPONSE")]
    WorldGeneric {
        simulation_status: SimulationStatus,
        user_defined: Value,
    },
}

impl Reply {
    /// Exchange family this reply closes.
    pub fn kind(&self) -> ExchangeKind {
        match self {
            Reply::InitCompleted { .. } => ExchangeKind::Init,
            Reply::Updated { .. } => ExchangeKind::Step,
            Reply::Generic { .. } => ExchangeKind::Generic,
            Reply::WorldGeneric { .. } => ExchangeKind::WorldGeneric,
        }
    }

    /// Status carried by every reply shape.
    pub fn status(&self) -> SimulationStatus {
        match self {
            Reply::InitCompleted {
                simulation_status, ..
            }
            | Reply::Updated {
                simulation_status, ..
            }
            | Reply::Generic {
                simulation_status, ..
            }
            | Reply::WorldGeneric {
                simulation_status, ..
            } => *simulation_status,
        }
    }
}

// ============================================================================
// FRAMING
// ============================================================================

pub fn encode_request(request: &Request) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(request)
}

pub fn decode_request(frame: &[u8]) -> Result<Request, serde_json::Error> {
    serde_json::from_slice(frame)
}

pub fn encode_reply(reply: &Reply) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(reply)
}

pub fn decode_reply(frame: &[u8]) -> Result<Reply, serde_json::Error> {
    serde_json::from_slice(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_snapshot(id: &str) -> EntitySnapshot {
        EntitySnapshot {
            entity_id: id.to_string(),
            entity_kind: "car".to_string(),
            position: [1.25, -2.5, 0.0],
            velocity: [13.9, 0.0, 0.0],
            rotation: [0.0, std::f64::consts::FRAC_PI_2, 0.0],
        }
    }

    #[test]
    fn test_init_request_tag_and_fields() {
        let request = Request::Init {
            timestamp: 0.0,
            run_id: "run-7".to_string(),
            run_configuration: RunConfiguration {
                seed: 7,
                step_size: 0.05,
                time_limit: -1.0,
            },
            entities: vec![EntityDecl {
                entity_id: "ego".to_string(),
                entity_kind: "car".to_string(),
                configuration: json!({"camera": true}),
            }],
            user_defined: json!({"scenario": "steady"}),
            entity_kinds: vec!["car".to_string(), "bicycle".to_string()],
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["message_type"], "INIT");
        assert_eq!(value["run_id"], "run-7");
        assert_eq!(value["run_configuration"]["time_limit"], -1.0);
        assert_eq!(value["entities"][0]["entity_id"], "ego");
        assert_eq!(value["entity_kinds"][1], "bicycle");

        let back: Request = serde_json::from_value(value).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_step_round_trip_preserves_floats() {
        let request = Request::Step {
            timestamp: 12.340000000000003,
            step_size: 0.1,
        };
        let frame = encode_request(&request).unwrap();
        let back = decode_request(&frame).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_reply_status_codes_on_wire() {
        let reply = Reply::Updated {
            simulation_status: SimulationStatus::FinishedAccident,
            entities: vec![sample_snapshot("v1")],
        };
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["message_type"], "UPDATED_POSITIONS");
        assert_eq!(value["simulation_status"], 2);
        assert_eq!(value["entities"][0]["rotation"][1], std::f64::consts::FRAC_PI_2);
    }

    #[test]
    fn test_error_status_is_minus_one() {
        let reply = Reply::Generic {
            simulation_status: SimulationStatus::Error,
            user_defined: Value::Null,
        };
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["simulation_status"], -1);
    }

    #[test]
    fn test_unknown_status_code_rejected() {
        let frame = json!({
            "message_type": "UPDATED_POSITIONS",
            "simulation_status": 9,
            "entities": [],
        });
        let result: Result<Reply, _> = serde_json::from_value(frame);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let result = decode_reply(br#"{"message_type": "SOMETHING_ELSE"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_field_rejected() {
        // UPDATED_POSITIONS without its entity list must not decode.
        let result = decode_reply(br#"{"message_type": "UPDATED_POSITIONS", "simulation_status": 0}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_reply_kind_and_status_accessors() {
        let reply = Reply::InitCompleted {
            simulation_status: SimulationStatus::Running,
            initial_timestamp: 0.25,
            entities: vec![],
        };
        assert_eq!(reply.kind(), ExchangeKind::Init);
        assert_eq!(reply.status(), SimulationStatus::Running);
        assert!(!reply.status().is_finished());
        assert!(SimulationStatus::FinishedTimeLimit.is_finished());
    }

    #[test]
    fn test_user_defined_stays_opaque() {
        let payload = json!({
            "nested": {"list": [1, 2, {"deep": null}]},
            "text": "ünïcode",
        });
        let request = Request::WorldGeneric {
            timestamp: 3.5,
            user_defined: payload.clone(),
        };
        let frame = encode_request(&request).unwrap();
        match decode_request(&frame).unwrap() {
            Request::WorldGeneric { user_defined, .. } => assert_eq!(user_defined, payload),
            other => panic!("wrong shape: {other:?}"),
        }
    }
}
