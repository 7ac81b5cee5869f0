use std::{sync::Arc, time::Duration};

use shared::{
    domain::{ConversationId, UserId},
    error::{ApiError, ErrorCode},
};
use storage::Storage;

pub mod autoreply;
pub mod calls;
pub mod fanout;
pub mod generator;
pub mod presence;
pub mod registry;
pub mod sync;
pub mod typing;

use generator::ResponseGenerator;
use registry::ConnectionRegistry;

/// Shared handle threaded through every event handler. Cheap to clone: the
/// storage pool and registry are reference-counted internally.
#[derive(Clone)]
pub struct RelayContext {
    pub storage: Storage,
    pub registry: ConnectionRegistry,
    pub generator: Arc<dyn ResponseGenerator>,
    pub auto_reply_delay: Duration,
}

/// Membership is re-validated against the store on every event because the
/// participant set can change between events.
pub async fn confirm_membership(
    ctx: &RelayContext,
    conversation_id: ConversationId,
    user_id: UserId,
) -> Result<(), ApiError> {
    ensure_participants(&ctx.storage, conversation_id, user_id).await?;
    Ok(())
}

pub(crate) async fn ensure_participants(
    storage: &Storage,
    conversation_id: ConversationId,
    user_id: UserId,
) -> Result<Vec<UserId>, ApiError> {
    let participants = storage
        .participants_of(conversation_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "conversation not found"))?;
    if !participants.contains(&user_id) {
        return Err(ApiError::new(
            ErrorCode::NotAParticipant,
            "you are not a participant of this conversation",
        ));
    }
    Ok(participants)
}

pub(crate) fn internal(err: anyhow::Error) -> ApiError {
    tracing::error!(error = %err, "storage operation failed");
    ApiError::new(ErrorCode::Internal, err.to_string())
}
