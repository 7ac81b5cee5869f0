use shared::{
    domain::{MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{MessagePayload, ServerEvent},
};
use storage::StoredMessage;
use tracing::debug;

use crate::{ensure_participants, fanout::message_payload, internal, RelayContext};

/// Only the original sender may rewrite a message's text. The full message
/// state is re-broadcast so every participant's devices converge.
pub async fn edit(
    ctx: &RelayContext,
    message_id: MessageId,
    actor_id: UserId,
    new_text: &str,
) -> Result<MessagePayload, ApiError> {
    let message = load_message(ctx, message_id).await?;
    let participants = ensure_participants(&ctx.storage, message.conversation_id, actor_id).await?;
    if message.sender_id != actor_id {
        return Err(ApiError::new(
            ErrorCode::NotAuthorized,
            "not authorized to edit this message",
        ));
    }
    let new_text = new_text.trim();
    if new_text.is_empty() {
        return Err(ApiError::new(
            ErrorCode::InvalidReference,
            "edited text cannot be empty",
        ));
    }

    ctx.storage
        .update_message_text(message_id, new_text)
        .await
        .map_err(internal)?;
    let payload = reload(ctx, message_id).await?;

    let event = ServerEvent::MessageUpdated {
        message: payload.clone(),
    };
    for participant in participants {
        ctx.registry.send_to_user(participant, &event);
    }
    debug!(message = message_id.0, "message edited");
    Ok(payload)
}

/// Blanks the content in place and tells every participant to drop the
/// message from view. The record survives so reply and forward references
/// stay resolvable.
pub async fn delete_for_everyone(
    ctx: &RelayContext,
    message_id: MessageId,
    actor_id: UserId,
) -> Result<(), ApiError> {
    let message = load_message(ctx, message_id).await?;
    let participants = ensure_participants(&ctx.storage, message.conversation_id, actor_id).await?;
    if message.sender_id != actor_id {
        return Err(ApiError::new(
            ErrorCode::NotAuthorized,
            "only the sender can delete for everyone",
        ));
    }

    ctx.storage
        .blank_message_for_everyone(message_id)
        .await
        .map_err(internal)?;

    let event = ServerEvent::MessageRemoved {
        message_id,
        conversation_id: message.conversation_id,
    };
    for participant in participants {
        ctx.registry.send_to_user(participant, &event);
    }
    debug!(message = message_id.0, "message deleted for everyone");
    Ok(())
}

/// Private visibility filter applied at read time; no broadcast. Idempotent.
pub async fn delete_for_me(
    ctx: &RelayContext,
    message_id: MessageId,
    actor_id: UserId,
) -> Result<(), ApiError> {
    let message = load_message(ctx, message_id).await?;
    ensure_participants(&ctx.storage, message.conversation_id, actor_id).await?;
    ctx.storage
        .add_delete_marker(message_id, actor_id)
        .await
        .map_err(internal)?;
    Ok(())
}

/// Toggle semantics: the same emoji retracts the user's reaction, a different
/// one replaces it, absence adds it. At most one reaction per user survives.
pub async fn react(
    ctx: &RelayContext,
    message_id: MessageId,
    actor_id: UserId,
    emoji: &str,
) -> Result<MessagePayload, ApiError> {
    if emoji.trim().is_empty() {
        return Err(ApiError::new(
            ErrorCode::InvalidReference,
            "reaction emoji is required",
        ));
    }
    let message = load_message(ctx, message_id).await?;
    let participants = ensure_participants(&ctx.storage, message.conversation_id, actor_id).await?;

    ctx.storage
        .toggle_reaction(message_id, actor_id, emoji.trim())
        .await
        .map_err(internal)?;
    let payload = reload(ctx, message_id).await?;

    let event = ServerEvent::MessageUpdated {
        message: payload.clone(),
    };
    for participant in participants {
        ctx.registry.send_to_user(participant, &event);
    }
    Ok(payload)
}

async fn load_message(ctx: &RelayContext, message_id: MessageId) -> Result<StoredMessage, ApiError> {
    ctx.storage
        .find_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "message not found"))
}

async fn reload(ctx: &RelayContext, message_id: MessageId) -> Result<MessagePayload, ApiError> {
    let stored = load_message(ctx, message_id).await?;
    let sender = ctx
        .storage
        .user_display(stored.sender_id)
        .await
        .map_err(internal)?;
    Ok(message_payload(stored, sender))
}
