//! Mesh message protocol — the envelope exchanged between routers.
//!
//! Envelopes are plain values. Which optional fields are populated is
//! determined by the [`Action`]; the typed constructors always produce a
//! valid combination and [`Envelope::validate`] rejects anything else at
//! the decode boundary.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::MeshError;
use crate::identity::{PeerId, RouterIdentity};

/// The action category of an [`Envelope`]. Encoded on the wire as an
/// integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Action {
    /// Handshake: the sender is ready to exchange messages.
    Ready = 0,
    /// The sender terminated the session.
    Closed = 1,
    /// Ask a peer whether it knows a router of some type.
    Lookup = 2,
    /// Regular application message.
    Message = 3,
    /// Flooded application message.
    Broadcast = 4,
    /// Positive lookup response.
    LookupFound = 5,
    /// Negative lookup response.
    LookupNotFound = 6,
    /// Ask the destination to open a session routed through the last hop.
    Connect = 7,
}

impl From<Action> for u8 {
    fn from(action: Action) -> Self {
        action as u8
    }
}

impl TryFrom<u8> for Action {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Ready,
            1 => Self::Closed,
            2 => Self::Lookup,
            3 => Self::Message,
            4 => Self::Broadcast,
            5 => Self::LookupFound,
            6 => Self::LookupNotFound,
            7 => Self::Connect,
            other => return Err(format!("unknown action {other}")),
        })
    }
}

/// Payload of a `LookupFound` envelope: the router that matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupHit {
    #[serde(rename = "uuid")]
    pub peer_id: PeerId,
    #[serde(rename = "type")]
    pub peer_type: String,
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Per-session counter of the session that emitted the envelope.
    pub seq: u64,
    pub action: Action,
    pub origin_type: String,
    #[serde(rename = "originID")]
    pub origin_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_type: Option<String>,
    #[serde(rename = "destinationID", default, skip_serializing_if = "Option::is_none")]
    pub destination_id: Option<PeerId>,
    /// Opaque application data. A present JSON `null` is kept as
    /// `Some(Value::Null)`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub data: Option<serde_json::Value>,
    /// Opaque authentication token, carried but never interpreted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<String>,
    /// Routers traversed so far, excluding origin and final destination.
    #[serde(default)]
    pub hops: Vec<PeerId>,
}

fn present_value<'de, D: Deserializer<'de>>(d: D) -> Result<Option<serde_json::Value>, D::Error> {
    serde_json::Value::deserialize(d).map(Some)
}

impl Envelope {
    fn base(seq: u64, action: Action, origin: &RouterIdentity) -> Self {
        Self {
            seq,
            action,
            origin_type: origin.peer_type.clone(),
            origin_id: origin.peer_id.clone(),
            destination_type: None,
            destination_id: None,
            data: None,
            authentication: None,
            hops: Vec::new(),
        }
    }

    /// Handshake envelope carrying the sender's identity. The destination
    /// is included when already known (gateway-routed handshakes need it).
    pub fn ready(seq: u64, origin: &RouterIdentity, destination: Option<&PeerId>) -> Self {
        let mut env = Self::base(seq, Action::Ready, origin);
        env.destination_id = destination.cloned();
        env
    }

    pub fn closed(seq: u64, origin: &RouterIdentity, destination: Option<&PeerId>) -> Self {
        let mut env = Self::base(seq, Action::Closed, origin);
        env.destination_id = destination.cloned();
        env
    }

    /// Ask `destination` whether it knows a router of `wanted_type`.
    pub fn lookup(
        seq: u64,
        origin: &RouterIdentity,
        destination: Option<&PeerId>,
        wanted_type: &str,
    ) -> Self {
        let mut env = Self::base(seq, Action::Lookup, origin);
        env.destination_id = destination.cloned();
        env.destination_type = Some(wanted_type.to_string());
        env
    }

    pub fn message(
        seq: u64,
        origin: &RouterIdentity,
        destination: Option<(&PeerId, &str)>,
        data: serde_json::Value,
        authentication: Option<String>,
    ) -> Self {
        let mut env = Self::base(seq, Action::Message, origin);
        if let Some((id, peer_type)) = destination {
            env.destination_id = Some(id.clone());
            env.destination_type = Some(peer_type.to_string());
        }
        env.data = Some(data);
        env.authentication = authentication;
        env
    }

    /// Broadcast envelopes are addressed to the next router only, so they
    /// can cross a gateway; each relay re-addresses them.
    pub fn broadcast(
        seq: u64,
        origin: &RouterIdentity,
        next: Option<&PeerId>,
        data: serde_json::Value,
        authentication: Option<String>,
    ) -> Self {
        let mut env = Self::base(seq, Action::Broadcast, origin);
        env.destination_id = next.cloned();
        env.data = Some(data);
        env.authentication = authentication;
        env
    }

    pub fn lookup_found(
        seq: u64,
        origin: &RouterIdentity,
        requester: &PeerId,
        wanted_type: &str,
        hit: &LookupHit,
    ) -> Result<Self, MeshError> {
        let mut env = Self::base(seq, Action::LookupFound, origin);
        env.destination_id = Some(requester.clone());
        env.destination_type = Some(wanted_type.to_string());
        env.data = Some(serde_json::to_value(hit)?);
        Ok(env)
    }

    pub fn lookup_not_found(
        seq: u64,
        origin: &RouterIdentity,
        requester: &PeerId,
        wanted_type: &str,
    ) -> Self {
        let mut env = Self::base(seq, Action::LookupNotFound, origin);
        env.destination_id = Some(requester.clone());
        env.destination_type = Some(wanted_type.to_string());
        env
    }

    /// Ask `destination` to open a session that uses the last hop as its
    /// gateway back to us.
    pub fn connect(
        seq: u64,
        origin: &RouterIdentity,
        destination: &PeerId,
        destination_type: Option<&str>,
    ) -> Self {
        let mut env = Self::base(seq, Action::Connect, origin);
        env.destination_id = Some(destination.clone());
        env.destination_type = destination_type.map(str::to_string);
        env
    }

    /// Check that the fields required by `action` are present.
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.origin_id.is_empty() {
            return Err(MeshError::MalformedEnvelope("missing originID".into()));
        }
        if self.origin_type.is_empty() {
            return Err(MeshError::MalformedEnvelope("missing originType".into()));
        }

        let missing = |field: &str| -> Result<(), MeshError> {
            Err(MeshError::MalformedEnvelope(format!(
                "{:?} envelope without {field}",
                self.action
            )))
        };

        match self.action {
            Action::Ready | Action::Closed => Ok(()),
            Action::Lookup | Action::LookupNotFound if self.destination_type.is_none() => {
                missing("destinationType")
            }
            Action::Lookup | Action::LookupNotFound => Ok(()),
            Action::Message | Action::Broadcast if self.data.is_none() => missing("data"),
            Action::Message | Action::Broadcast => Ok(()),
            Action::LookupFound => {
                if self.destination_type.is_none() {
                    return missing("destinationType");
                }
                self.lookup_hit().map(|_| ())
            }
            Action::Connect if self.destination_id.is_none() => missing("destinationID"),
            Action::Connect => Ok(()),
        }
    }

    /// Decode the [`LookupHit`] payload of a `LookupFound` envelope.
    pub fn lookup_hit(&self) -> Result<LookupHit, MeshError> {
        let data = self
            .data
            .clone()
            .ok_or_else(|| MeshError::MalformedEnvelope("lookup response without data".into()))?;
        serde_json::from_value(data)
            .map_err(|e| MeshError::MalformedEnvelope(format!("bad lookup payload: {e}")))
    }

    /// Copy of this envelope with `router` appended to the hop path.
    pub fn forwarded_by(&self, router: &PeerId) -> Self {
        let mut env = self.clone();
        env.hops.push(router.clone());
        env
    }

    /// Copy of this envelope addressed to `next`.
    pub fn addressed_to(&self, next: &PeerId) -> Self {
        let mut env = self.clone();
        env.destination_id = Some(next.clone());
        env
    }

    /// Fill in the destination if it is not set yet.
    pub fn with_destination(mut self, id: &PeerId, peer_type: &str) -> Self {
        if self.destination_id.is_none() {
            self.destination_id = Some(id.clone());
            if self.destination_type.is_none() && self.action == Action::Message {
                self.destination_type = Some(peer_type.to_string());
            }
        }
        self
    }

    /// The router this envelope was last relayed by, if any.
    pub fn last_hop(&self) -> Option<&PeerId> {
        self.hops.last()
    }

    /// Serialize the envelope to a JSON string for transmission.
    pub fn to_json(&self) -> Result<String, MeshError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode and validate an envelope from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, MeshError> {
        let env: Self =
            serde_json::from_str(json).map_err(|e| MeshError::MalformedEnvelope(e.to_string()))?;
        env.validate()?;
        Ok(env)
    }

    /// Decode and validate an envelope from a structured JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self, MeshError> {
        let env: Self =
            serde_json::from_value(value).map_err(|e| MeshError::MalformedEnvelope(e.to_string()))?;
        env.validate()?;
        Ok(env)
    }

    pub fn to_value(&self) -> Result<serde_json::Value, MeshError> {
        Ok(serde_json::to_value(self)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
