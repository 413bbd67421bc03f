//! Application payload relay.
//!
//! Outside the step cadence, local application code can exchange opaque
//! payloads with its authoritative counterpart ([`AppMessaging::call`]) or
//! with the authoritative world itself ([`AppMessaging::call_world`]). The
//! bridge forwards payloads byte-for-byte and never inspects them; the typed
//! wrappers on [`SyncEngine`] are serde sugar over the same exchanges.
//!
//! Relays ride the same strict request/reply transport as steps, so they are
//! only legal while the engine is `Stepping`, and a terminal status in a
//! relay reply ends the run exactly like one in a step reply.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::engine::SyncEngine;
use crate::error::{BridgeError, RunEnd};
use crate::messages::ExchangeKind;

/// Fallback multiplier for relay exchanges; callers with latency knowledge
/// pass their own.
pub const GENERIC_TIMEOUT_MULTIPLIER: f64 = 10.0;

/// Outcome of a relay exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayReply<T = Value> {
    /// The counterpart answered; here is its payload.
    Payload(T),
    /// The authoritative side declared the run over instead of answering.
    Finished(RunEnd),
}

/// Synchronous application-payload exchanges with the authoritative side.
pub trait AppMessaging {
    /// Sends `payload` to the authoritative counterpart of the calling
    /// application and waits for its reply.
    fn call(&mut self, payload: Value, multiplier: f64) -> Result<RelayReply, BridgeError>;

    /// Sends `payload` to the authoritative world controller and waits for
    /// its reply.
    fn call_world(&mut self, payload: Value, multiplier: f64) -> Result<RelayReply, BridgeError>;
}

impl AppMessaging for SyncEngine {
    fn call(&mut self, payload: Value, multiplier: f64) -> Result<RelayReply, BridgeError> {
        self.passthrough(false, payload, multiplier)
    }

    fn call_world(&mut self, payload: Value, multiplier: f64) -> Result<RelayReply, BridgeError> {
        self.passthrough(true, payload, multiplier)
    }
}

impl SyncEngine {
    /// [`AppMessaging::call`] with serde conversion at both ends.
    pub fn call_typed<S, T>(
        &mut self,
        request: &S,
        multiplier: f64,
    ) -> Result<RelayReply<T>, BridgeError>
    where
        S: Serialize,
        T: DeserializeOwned,
    {
        let payload = to_payload(ExchangeKind::Generic, request)?;
        from_payload(ExchangeKind::Generic, self.call(payload, multiplier)?)
    }

    /// [`AppMessaging::call_world`] with serde conversion at both ends.
    pub fn call_world_typed<S, T>(
        &mut self,
        request: &S,
        multiplier: f64,
    ) -> Result<RelayReply<T>, BridgeError>
    where
        S: Serialize,
        T: DeserializeOwned,
    {
        let payload = to_payload(ExchangeKind::WorldGeneric, request)?;
        from_payload(ExchangeKind::WorldGeneric, self.call_world(payload, multiplier)?)
    }
}

fn to_payload<S: Serialize>(exchange: ExchangeKind, request: &S) -> Result<Value, BridgeError> {
    serde_json::to_value(request).map_err(|e| BridgeError::ProtocolError {
        exchange,
        reason: format!("user payload encoding failed: {e}"),
    })
}

fn from_payload<T: DeserializeOwned>(
    exchange: ExchangeKind,
    reply: RelayReply,
) -> Result<RelayReply<T>, BridgeError> {
    match reply {
        RelayReply::Payload(value) => {
            let typed = serde_json::from_value(value).map_err(|e| BridgeError::ProtocolError {
                exchange,
                reason: format!("user payload has unexpected shape: {e}"),
            })?;
            Ok(RelayReply::Payload(typed))
        }
        RelayReply::Finished(end) => Ok(RelayReply::Finished(end)),
    }
}
