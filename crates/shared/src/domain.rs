use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);
id_newtype!(CallId);

/// One live transport session. Minted fresh on every WebSocket upgrade and
/// never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Display snapshot attached to a connection at setup. Not refreshed on
/// profile edits for the lifetime of the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDisplay {
    pub name: String,
    pub avatar_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallMedia {
    Voice,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Connected,
    Ended,
    Missed,
    Rejected,
    Cancelled,
}

impl CallStatus {
    /// Lifecycle guard: `ringing` settles into exactly one of
    /// `connected`/`missed`/`rejected`/`cancelled`, and only a `connected`
    /// call may become `ended`. Terminal states accept nothing.
    pub fn can_transition_to(self, next: CallStatus) -> bool {
        match self {
            CallStatus::Ringing => matches!(
                next,
                CallStatus::Connected
                    | CallStatus::Missed
                    | CallStatus::Rejected
                    | CallStatus::Cancelled
            ),
            CallStatus::Connected => matches!(next, CallStatus::Ended),
            CallStatus::Ended
            | CallStatus::Missed
            | CallStatus::Rejected
            | CallStatus::Cancelled => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEndReason {
    Completed,
    Cancelled,
    Missed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AutoReplyTone {
    #[default]
    Friendly,
    Professional,
    Funny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteScope {
    #[serde(rename = "self")]
    SelfOnly,
    Everyone,
}
