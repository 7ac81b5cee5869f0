use serde_json::Value;
use shared::{
    domain::{CallEndReason, CallId, CallMedia, CallStatus, ConversationId, UserDisplay, UserId},
    error::{ApiError, ErrorCode},
    protocol::ServerEvent,
};
use storage::CallTransition;
use tracing::{debug, info, warn};

use crate::{ensure_participants, internal, RelayContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// Starts a call attempt. The reachability check runs before anything is
/// persisted: an unreachable recipient means no session row at all.
pub async fn initiate(
    ctx: &RelayContext,
    caller_id: UserId,
    caller: &UserDisplay,
    recipient_id: UserId,
    conversation_id: ConversationId,
    media: CallMedia,
) -> Result<ServerEvent, ApiError> {
    ensure_participants(&ctx.storage, conversation_id, caller_id).await?;

    if !ctx.registry.is_online(recipient_id) {
        return Err(ApiError::new(
            ErrorCode::RecipientUnreachable,
            "user is offline or unavailable",
        ));
    }

    let call_id = ctx
        .storage
        .create_call(caller_id, recipient_id, media)
        .await
        .map_err(internal)?;
    info!(
        call = call_id.0,
        caller = caller_id.0,
        recipient = recipient_id.0,
        "call ringing"
    );

    ctx.registry.send_to_user(
        recipient_id,
        &ServerEvent::CallIncoming {
            call_id,
            caller_id,
            caller: caller.clone(),
            media,
            conversation_id,
        },
    );

    Ok(ServerEvent::CallRinging {
        recipient_id,
        status: "ringing".to_string(),
    })
}

/// Commits the `ringing -> connected` transition and notifies the caller's
/// connections. Fails if the caller went unreachable while the call rang.
pub async fn accept(
    ctx: &RelayContext,
    recipient_id: UserId,
    recipient: &UserDisplay,
    caller_id: UserId,
) -> Result<(), ApiError> {
    if !ctx.registry.is_online(caller_id) {
        return Err(ApiError::new(
            ErrorCode::CallerUnavailable,
            "caller is no longer available",
        ));
    }

    settle_ringing(ctx, caller_id, recipient_id, CallStatus::Connected).await;
    ctx.registry.send_to_user(
        caller_id,
        &ServerEvent::CallAccepted {
            recipient_id,
            recipient: recipient.clone(),
        },
    );
    Ok(())
}

/// A late reject after the caller gave up is still relayed when possible and
/// silently dropped otherwise. This is the one relay operation that never
/// errors on an unreachable peer.
pub async fn reject(
    ctx: &RelayContext,
    recipient_id: UserId,
    caller_id: UserId,
    reason: Option<String>,
) -> Result<(), ApiError> {
    settle_ringing(ctx, caller_id, recipient_id, CallStatus::Rejected).await;
    ctx.registry.send_to_user(
        caller_id,
        &ServerEvent::CallRejected {
            recipient_id,
            reason: reason.unwrap_or_else(|| "Call declined".to_string()),
        },
    );
    Ok(())
}

/// Symmetric hang-up from either party. Which side rang is unknown here, so a
/// still-ringing session is cancelled in whichever direction it exists; an
/// established call is closed separately through `record_end`.
pub async fn terminate(
    ctx: &RelayContext,
    user_id: UserId,
    peer_id: UserId,
) -> Result<(), ApiError> {
    settle_ringing(ctx, user_id, peer_id, CallStatus::Cancelled).await;
    settle_ringing(ctx, peer_id, user_id, CallStatus::Cancelled).await;

    let delivered = ctx.registry.send_to_user(
        peer_id,
        &ServerEvent::CallEnded {
            user_id,
            reason: "Call ended by other user".to_string(),
        },
    );
    if delivered == 0 {
        return Err(ApiError::new(
            ErrorCode::RecipientUnreachable,
            "peer has no live connections",
        ));
    }
    Ok(())
}

/// Forwards an offer/answer/ICE payload opaquely; content is never inspected.
pub async fn relay_signal(
    ctx: &RelayContext,
    kind: SignalKind,
    sender_id: UserId,
    recipient_id: UserId,
    payload: Value,
) -> Result<(), ApiError> {
    if payload.is_null() {
        return Err(ApiError::new(
            ErrorCode::InvalidReference,
            "signal payload is required",
        ));
    }
    if !ctx.registry.is_online(recipient_id) {
        return Err(ApiError::new(
            ErrorCode::RecipientUnreachable,
            "recipient has no live connections",
        ));
    }

    let event = match kind {
        SignalKind::Offer => ServerEvent::WebrtcOffer { sender_id, payload },
        SignalKind::Answer => ServerEvent::WebrtcAnswer { sender_id, payload },
        SignalKind::IceCandidate => ServerEvent::WebrtcIceCandidate { sender_id, payload },
    };
    ctx.registry.send_to_user(recipient_id, &event);
    Ok(())
}

/// Caller-driven ring timeout: the ringing session settles into `missed` and
/// the recipient's devices are told about the missed call.
pub async fn no_answer(
    ctx: &RelayContext,
    caller_id: UserId,
    caller: &UserDisplay,
    recipient_id: UserId,
) -> Result<(), ApiError> {
    settle_ringing(ctx, caller_id, recipient_id, CallStatus::Missed).await;

    let delivered = ctx.registry.send_to_user(
        recipient_id,
        &ServerEvent::CallMissed {
            caller_id,
            caller: caller.clone(),
        },
    );
    if delivered == 0 {
        return Err(ApiError::new(
            ErrorCode::RecipientUnreachable,
            "recipient has no live connections",
        ));
    }
    Ok(())
}

/// Recipient-driven busy signal while already in another call.
pub async fn busy(
    ctx: &RelayContext,
    recipient_id: UserId,
    caller_id: UserId,
) -> Result<(), ApiError> {
    let delivered = ctx.registry.send_to_user(
        caller_id,
        &ServerEvent::CallBusy {
            recipient_id,
            message: "User is busy on another call".to_string(),
        },
    );
    if delivered == 0 {
        return Err(ApiError::new(
            ErrorCode::CallerUnavailable,
            "caller has no live connections",
        ));
    }
    Ok(())
}

/// The only operation that persists `connected -> ended`, stamping end time
/// and reason.
pub async fn record_end(
    ctx: &RelayContext,
    call_id: CallId,
    reason: CallEndReason,
) -> Result<(), ApiError> {
    match ctx
        .storage
        .record_call_end(call_id, reason)
        .await
        .map_err(internal)?
    {
        CallTransition::Applied { from } => {
            info!(call = call_id.0, ?from, ?reason, "call ended");
            Ok(())
        }
        CallTransition::NotFound => Err(ApiError::new(ErrorCode::NotFound, "call not found")),
        CallTransition::Refused { .. } => Err(ApiError::new(
            ErrorCode::InvalidReference,
            "call is not connected",
        )),
    }
}

/// Best-effort settlement of the latest ringing session for a pair. The
/// notification goes out regardless; a session that already settled, or never
/// existed, is left alone.
async fn settle_ringing(
    ctx: &RelayContext,
    caller_id: UserId,
    recipient_id: UserId,
    next: CallStatus,
) {
    let call_id = match ctx.storage.latest_ringing_call(caller_id, recipient_id).await {
        Ok(Some(call_id)) => call_id,
        Ok(None) => return,
        Err(error) => {
            warn!(%error, "ringing-call lookup failed");
            return;
        }
    };
    match ctx.storage.update_call_status(call_id, next).await {
        Ok(CallTransition::Applied { .. }) => {
            debug!(call = call_id.0, ?next, "call settled");
        }
        Ok(outcome) => {
            debug!(call = call_id.0, ?next, ?outcome, "call already settled");
        }
        Err(error) => {
            warn!(call = call_id.0, %error, "call status update failed");
        }
    }
}
