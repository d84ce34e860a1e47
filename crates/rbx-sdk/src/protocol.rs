//! Wire shapes exchanged with the server.
//!
//! Field names use the compact encoding of the protocol; the Rust names are
//! spelled out.

use crate::error::ClientError;
use rbx_cud::{CudId, CudPackage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event a databox connect request is emitted to.
pub const DATABOX_START_INDICATOR: &str = ">D";
/// Event a channel subscribe request is emitted to.
pub const CHANNEL_START_INDICATOR: &str = ">C";
/// Event carrying channel publishes.
pub const CHANNEL_PUBLISH_EVENT: &str = "C>P";
/// Event carrying channel kick-outs.
pub const CHANNEL_KICK_OUT_EVENT: &str = "C>K";
/// Action code sent to a full channel id to unsubscribe.
pub const CHANNEL_UNSUBSCRIBE_ACTION: u8 = 0;

macro_rules! wire_code {
    ($name:ident, $what:literal) => {
        impl TryFrom<u8> for $name {
            type Error = ClientError;

            fn try_from(code: u8) -> Result<Self, Self::Error> {
                Self::ALL
                    .iter()
                    .copied()
                    .find(|v| *v as u8 == code)
                    .ok_or_else(|| ClientError::Protocol(format!("unknown {} code {}", $what, code)))
            }
        }

        impl From<$name> for u8 {
            fn from(value: $name) -> u8 {
                value as u8
            }
        }
    };
}

/// Session actions a client can invoke on its databox.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum InputAction {
    Fetch = 0,
    ResetSession = 1,
    CopySession = 2,
    Disconnect = 3,
    GetLastCudId = 4,
    History = 5,
    /// Current data of the databox, loaded into the addressed session.
    Snapshot = 6,
}

impl InputAction {
    const ALL: [InputAction; 7] = [
        InputAction::Fetch,
        InputAction::ResetSession,
        InputAction::CopySession,
        InputAction::Disconnect,
        InputAction::GetLastCudId,
        InputAction::History,
        InputAction::Snapshot,
    ];
}

wire_code!(InputAction, "input action");

/// Which of the two server-side sessions an action addresses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SessionTarget {
    #[default]
    Main = 0,
    Reload = 1,
}

impl SessionTarget {
    const ALL: [SessionTarget; 2] = [SessionTarget::Main, SessionTarget::Reload];
}

wire_code!(SessionTarget, "session target");

/// Events the server pushes to a connected databox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputAction {
    Cud = 0,
    Close = 1,
    Reload = 2,
    KickOut = 3,
    Signal = 4,
}

impl OutputAction {
    const ALL: [OutputAction; 5] = [
        OutputAction::Cud,
        OutputAction::Close,
        OutputAction::Reload,
        OutputAction::KickOut,
        OutputAction::Signal,
    ];
}

wire_code!(OutputAction, "output action");

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectRequest {
    #[serde(rename = "d")]
    pub databox: String,
    #[serde(rename = "i", default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    #[serde(rename = "al", default, skip_serializing_if = "Option::is_none")]
    pub api_level: Option<u32>,
    /// Session token of a previous connection to restore.
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(rename = "ii", default, skip_serializing_if = "Option::is_none")]
    pub init_input: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectResponse {
    #[serde(rename = "ci")]
    pub last_cud_id: CudId,
    /// False when the server could not restore the session token.
    #[serde(rename = "ut", default)]
    pub token_used: bool,
    #[serde(rename = "i")]
    pub input_key: String,
    #[serde(rename = "o")]
    pub output_key: String,
    #[serde(rename = "pf", default)]
    pub parallel_fetch: bool,
    /// Initial snapshot of the databox data.
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Value>,
}

/// A session action sent to the databox input key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputPackage {
    #[serde(rename = "a")]
    pub action: InputAction,
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub target: Option<SessionTarget>,
    #[serde(rename = "i", default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

impl InputPackage {
    pub fn new(action: InputAction) -> Self {
        Self {
            action,
            target: None,
            input: None,
        }
    }

    pub fn with_target(mut self, target: SessionTarget) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FetchResponse {
    /// Per-session fetch counter assigned by the server.
    #[serde(rename = "c")]
    pub counter: u64,
    /// Session token to restore this fetch position after a reconnect.
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(rename = "d", default)]
    pub data: Value,
}

/// Fresh data of a databox session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotResponse {
    /// Id of the newest cud package the snapshot contains.
    #[serde(rename = "ci")]
    pub last_cud_id: CudId,
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&ConnectResponse> for SnapshotResponse {
    fn from(response: &ConnectResponse) -> Self {
        Self {
            last_cud_id: response.last_cud_id,
            data: response.snapshot.clone(),
        }
    }
}

/// Retained cud packages after a given id.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryResponse {
    /// Oldest id the server still retains; `None` if it retains nothing.
    #[serde(default)]
    pub oldest: Option<CudId>,
    #[serde(default)]
    pub packages: Vec<CudPackage>,
}

/// A server push on the databox output key.
///
/// The action stays a raw code so unknown actions can be logged and dropped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputPackage {
    #[serde(rename = "a")]
    pub action: u8,
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Value>,
    /// Signal name.
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelSubscribeRequest {
    #[serde(rename = "c")]
    pub channel: String,
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    #[serde(rename = "a", default, skip_serializing_if = "Option::is_none")]
    pub api_level: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelPublishPackage {
    #[serde(rename = "i")]
    pub channel_id: String,
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    #[serde(rename = "e")]
    pub event: String,
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelKickOutPackage {
    #[serde(rename = "i")]
    pub channel_id: String,
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Value>,
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}
