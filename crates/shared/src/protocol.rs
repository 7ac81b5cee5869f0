use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        CallEndReason, CallId, CallMedia, ConversationId, DeleteScope, MediaKind, MessageId,
        UserDisplay, UserId,
    },
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub url: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionPayload {
    pub user_id: UserId,
    pub emoji: String,
}

/// Fully enriched message state as broadcast to participants. Re-sent whole
/// after edits and reaction toggles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<UserDisplay>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub forwarded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_from: Option<UserId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<ReactionPayload>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_deleted_for_everyone: bool,
    #[serde(default)]
    pub auto_generated: bool,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    JoinConversation {
        conversation_id: ConversationId,
    },
    LeaveConversation {
        conversation_id: ConversationId,
    },
    SendMessage {
        conversation_id: ConversationId,
        #[serde(default)]
        text: String,
        #[serde(default)]
        media: Vec<MediaDescriptor>,
        #[serde(default)]
        reply_to: Option<MessageId>,
        #[serde(default)]
        forwarded: bool,
        #[serde(default)]
        forwarded_from: Option<UserId>,
    },
    EditMessage {
        message_id: MessageId,
        new_text: String,
    },
    DeleteMessage {
        message_id: MessageId,
        scope: DeleteScope,
    },
    ReactMessage {
        message_id: MessageId,
        emoji: String,
    },
    TypingStarted {
        conversation_id: ConversationId,
    },
    TypingStopped {
        conversation_id: ConversationId,
    },
    CallInitiate {
        recipient_id: UserId,
        media: CallMedia,
        conversation_id: ConversationId,
    },
    CallAccept {
        caller_id: UserId,
    },
    CallReject {
        caller_id: UserId,
        #[serde(default)]
        reason: Option<String>,
    },
    CallEnd {
        peer_id: UserId,
    },
    WebrtcOffer {
        recipient_id: UserId,
        payload: serde_json::Value,
    },
    WebrtcAnswer {
        recipient_id: UserId,
        payload: serde_json::Value,
    },
    WebrtcIceCandidate {
        recipient_id: UserId,
        payload: serde_json::Value,
    },
    CallNoAnswer {
        recipient_id: UserId,
    },
    CallBusy {
        caller_id: UserId,
    },
    CallRecordEnd {
        call_id: CallId,
        reason: CallEndReason,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    OnlineUsers {
        user_ids: Vec<UserId>,
    },
    MessageReceived {
        message: MessagePayload,
    },
    MessageUpdated {
        message: MessagePayload,
    },
    MessageRemoved {
        message_id: MessageId,
        conversation_id: ConversationId,
    },
    UserTyping {
        conversation_id: ConversationId,
        user_id: UserId,
        user: UserDisplay,
    },
    UserStoppedTyping {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    CallIncoming {
        call_id: CallId,
        caller_id: UserId,
        caller: UserDisplay,
        media: CallMedia,
        conversation_id: ConversationId,
    },
    CallRinging {
        recipient_id: UserId,
        status: String,
    },
    CallAccepted {
        recipient_id: UserId,
        recipient: UserDisplay,
    },
    CallRejected {
        recipient_id: UserId,
        reason: String,
    },
    CallEnded {
        user_id: UserId,
        reason: String,
    },
    CallMissed {
        caller_id: UserId,
        caller: UserDisplay,
    },
    CallBusy {
        recipient_id: UserId,
        message: String,
    },
    WebrtcOffer {
        sender_id: UserId,
        payload: serde_json::Value,
    },
    WebrtcAnswer {
        sender_id: UserId,
        payload: serde_json::Value,
    },
    WebrtcIceCandidate {
        sender_id: UserId,
        payload: serde_json::Value,
    },
    Error(ApiError),
}
