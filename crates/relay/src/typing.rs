use shared::{
    domain::{ConversationId, UserDisplay, UserId},
    error::ApiError,
    protocol::ServerEvent,
};

use crate::{ensure_participants, RelayContext};

/// Ephemeral relay: nothing is persisted and the originator is never echoed.
/// Stop events are the caller's responsibility; there is no timeout here.
pub async fn started(
    ctx: &RelayContext,
    conversation_id: ConversationId,
    user_id: UserId,
    user: &UserDisplay,
) -> Result<(), ApiError> {
    let participants = ensure_participants(&ctx.storage, conversation_id, user_id).await?;
    let event = ServerEvent::UserTyping {
        conversation_id,
        user_id,
        user: user.clone(),
    };
    for participant in participants {
        if participant != user_id {
            ctx.registry.send_to_user(participant, &event);
        }
    }
    Ok(())
}

pub async fn stopped(
    ctx: &RelayContext,
    conversation_id: ConversationId,
    user_id: UserId,
) -> Result<(), ApiError> {
    let participants = ensure_participants(&ctx.storage, conversation_id, user_id).await?;
    let event = ServerEvent::UserStoppedTyping {
        conversation_id,
        user_id,
    };
    for participant in participants {
        if participant != user_id {
            ctx.registry.send_to_user(participant, &event);
        }
    }
    Ok(())
}
