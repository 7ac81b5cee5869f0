use shared::{
    domain::{ConversationId, MessageId, UserDisplay, UserId},
    error::{ApiError, ErrorCode},
    protocol::{MediaDescriptor, MessagePayload, ReactionPayload, ServerEvent},
};
use storage::{NewStoredMessage, StoredMedia, StoredMessage};
use tracing::{debug, warn};

use crate::{autoreply, ensure_participants, internal, RelayContext};

#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub text: String,
    pub media: Vec<MediaDescriptor>,
    pub reply_to: Option<MessageId>,
    pub forwarded: bool,
    pub forwarded_from: Option<UserId>,
    pub auto_generated: bool,
}

/// Validates membership, persists the message, and delivers it to every live
/// connection of every participant, the sender's other connections included,
/// so all of a user's devices converge. Participants who are unreachable and
/// have auto-reply enabled are handed to the scheduler without blocking
/// delivery.
pub async fn submit(
    ctx: &RelayContext,
    conversation_id: ConversationId,
    sender_id: UserId,
    new: NewMessage,
) -> Result<MessagePayload, ApiError> {
    let participants = ensure_participants(&ctx.storage, conversation_id, sender_id).await?;

    let text = new.text.trim().to_string();
    if text.is_empty() && new.media.is_empty() {
        return Err(ApiError::new(
            ErrorCode::InvalidReference,
            "message must include text or media",
        ));
    }

    if let Some(reply_to) = new.reply_to {
        let original = ctx
            .storage
            .find_message(reply_to)
            .await
            .map_err(internal)?
            .ok_or_else(|| {
                ApiError::new(ErrorCode::InvalidReference, "replied-to message not found")
            })?;
        if original.conversation_id != conversation_id {
            return Err(ApiError::new(
                ErrorCode::InvalidReference,
                "replied-to message belongs to another conversation",
            ));
        }
    }

    let stored = ctx
        .storage
        .insert_message(NewStoredMessage {
            conversation_id,
            sender_id,
            text: text.clone(),
            media: new
                .media
                .iter()
                .map(|m| StoredMedia {
                    url: m.url.clone(),
                    kind: m.kind,
                })
                .collect(),
            reply_to: new.reply_to,
            forwarded: new.forwarded,
            forwarded_from: new.forwarded_from,
            auto_generated: new.auto_generated,
        })
        .await
        .map_err(internal)?;

    let sender = ctx
        .storage
        .user_display(sender_id)
        .await
        .map_err(internal)?;
    let payload = message_payload(stored, sender);
    let event = ServerEvent::MessageReceived {
        message: payload.clone(),
    };

    let mut delivered = 0;
    for participant in &participants {
        delivered += ctx.registry.send_to_user(*participant, &event);
    }
    debug!(
        conversation = conversation_id.0,
        message = payload.message_id.0,
        connections = delivered,
        "message fanned out"
    );

    for participant in participants {
        if participant == sender_id || ctx.registry.is_online(participant) {
            continue;
        }
        match ctx.storage.auto_reply_settings(participant).await {
            Ok(Some(settings)) if settings.enabled => {
                autoreply::schedule(ctx.clone(), participant, conversation_id, text.clone());
            }
            Ok(_) => {}
            Err(error) => {
                warn!(user = participant.0, %error, "auto-reply settings lookup failed");
            }
        }
    }

    Ok(payload)
}

/// Display-enriched wire shape of a persisted message.
pub(crate) fn message_payload(
    stored: StoredMessage,
    sender: Option<UserDisplay>,
) -> MessagePayload {
    MessagePayload {
        message_id: stored.message_id,
        conversation_id: stored.conversation_id,
        sender_id: stored.sender_id,
        sender,
        text: stored.text,
        media: stored
            .media
            .into_iter()
            .map(|m| MediaDescriptor {
                url: m.url,
                kind: m.kind,
            })
            .collect(),
        reply_to: stored.reply_to,
        forwarded: stored.forwarded,
        forwarded_from: stored.forwarded_from,
        reactions: stored
            .reactions
            .into_iter()
            .map(|r| ReactionPayload {
                user_id: r.user_id,
                emoji: r.emoji,
            })
            .collect(),
        is_edited: stored.is_edited,
        edited_at: stored.edited_at,
        is_deleted_for_everyone: stored.is_deleted_for_everyone,
        auto_generated: stored.auto_generated,
        sent_at: stored.created_at,
    }
}
