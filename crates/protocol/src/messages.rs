use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Control messages exchanged over the session's message channel.
///
/// The `type` field selects the variant. Decoding goes through [`decode`],
/// which reads the discriminator first so that unknown types can be kept as
/// raw JSON instead of failing the whole channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Bearer token obtained from `/api/login`
    Auth { token: String },
    /// Sent by the server for every message rejected before authentication
    AuthFailure { error: String },
    /// SDP offer from the server, plus the ICE servers the client should use
    Offer {
        sdp: String,
        #[serde(
            rename = "iceServers",
            default,
            skip_serializing_if = "Vec::is_empty"
        )]
        ice_servers: Vec<IceServerInfo>,
    },
    /// SDP answer from the client
    Answer { sdp: String },
    /// Trickled ICE candidate from the client
    #[serde(rename = "candidate")]
    IceCandidate { candidate: IceCandidate },
    Keyboard { event: KeyEvent },
    MouseButton {
        button: u8,
        x: i32,
        y: i32,
        down: bool,
    },
    MouseMove { x: i32, y: i32 },
    MouseWheel {
        #[serde(rename = "deltaX")]
        delta_x: f64,
        #[serde(rename = "deltaY")]
        delta_y: f64,
        #[serde(rename = "deltaZ")]
        delta_z: f64,
    },
}

/// Wire discriminators understood by [`Message`].
pub const MESSAGE_TYPES: &[&str] = &[
    "auth",
    "auth_failure",
    "offer",
    "answer",
    "candidate",
    "keyboard",
    "mouse_button",
    "mouse_move",
    "mouse_wheel",
];

impl Message {
    /// Wire discriminator of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Auth { .. } => "auth",
            Message::AuthFailure { .. } => "auth_failure",
            Message::Offer { .. } => "offer",
            Message::Answer { .. } => "answer",
            Message::IceCandidate { .. } => "candidate",
            Message::Keyboard { .. } => "keyboard",
            Message::MouseButton { .. } => "mouse_button",
            Message::MouseMove { .. } => "mouse_move",
            Message::MouseWheel { .. } => "mouse_wheel",
        }
    }
}

/// Result of decoding one frame from the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(Message),
    /// Valid JSON whose `type` is missing or not one we know
    Unrecognized(serde_json::Value),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode a text frame in two passes: peek at `type`, then decode into the
/// matching shape. A known `type` with a bad body is an error; an unknown
/// `type` is returned as [`Decoded::Unrecognized`].
pub fn decode(text: &str) -> Result<Decoded, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let known = value
        .get("type")
        .and_then(|t| t.as_str())
        .is_some_and(|t| MESSAGE_TYPES.contains(&t));
    if !known {
        return Ok(Decoded::Unrecognized(value));
    }
    Ok(Decoded::Message(serde_json::from_value(value)?))
}

/// Browser `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

/// Browser `KeyboardEvent`, reduced to what input injection needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyEvent {
    /// Logical key value, e.g. "a" or "Enter"
    pub key: String,
    /// Physical key code, e.g. "KeyA"
    pub code: String,
    #[serde(default)]
    pub location: KeyLocation,
    #[serde(rename = "keyDown")]
    pub key_down: bool,
}

/// `KeyboardEvent.location`, sent as a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum KeyLocation {
    #[default]
    Standard,
    Left,
    Right,
    Numpad,
}

impl TryFrom<u8> for KeyLocation {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(KeyLocation::Standard),
            1 => Ok(KeyLocation::Left),
            2 => Ok(KeyLocation::Right),
            3 => Ok(KeyLocation::Numpad),
            other => Err(format!("invalid key location {other}")),
        }
    }
}

impl From<KeyLocation> for u8 {
    fn from(location: KeyLocation) -> u8 {
        location as u8
    }
}

/// ICE server entry handed to the client alongside the offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServerInfo {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Login request body.
/// Password is redacted in Debug output to prevent accidental logging.
#[derive(Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
}

/// Session information exposed by the admin endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub username: String,
    pub state: String,
    pub created_at: u64,
}
