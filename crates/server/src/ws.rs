use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use relay::{calls, calls::SignalKind, fanout, presence, sync, typing};
use serde::Deserialize;
use shared::{
    domain::{ConnectionId, DeleteScope, UserDisplay, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ClientRequest, ServerEvent},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{error, info};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// Connection setup: credential extraction and verification happen before the
/// upgrade completes, so a rejected client is never registered.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<WsQuery>,
) -> Response {
    let Some(token) = crate::auth::extract_credential(&headers, q.token.as_deref()) else {
        return unauthorized("no credential provided");
    };
    let user_id = match state.verifier.verify(&token) {
        Ok(user_id) => user_id,
        Err(exception) => {
            return (StatusCode::UNAUTHORIZED, Json(ApiError::from(exception))).into_response()
        }
    };
    // display snapshot pinned for the connection's lifetime
    let display = match state.relay.storage.user_display(user_id).await {
        Ok(Some(display)) => display,
        Ok(None) => return unauthorized("unknown user"),
        Err(err) => {
            error!(user = user_id.0, error = %err, "user lookup failed during connection setup");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::new(ErrorCode::Internal, "storage unavailable")),
            )
                .into_response();
        }
    };

    ws.on_upgrade(move |socket| run_connection(state, socket, user_id, display))
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiError::new(ErrorCode::AuthenticationFailed, message)),
    )
        .into_response()
}

async fn run_connection(
    state: Arc<AppState>,
    socket: WebSocket,
    user_id: UserId,
    display: UserDisplay,
) {
    let connection_id = ConnectionId::new();
    let (tx, rx) = mpsc::unbounded_channel();
    state.relay.registry.register(user_id, connection_id, tx.clone());
    presence::broadcast_online_roster(&state.relay.registry);
    let display_name = display.name.as_str();
    info!(user = user_id.0, connection = %connection_id.0, name = %display_name, "connected");

    let (mut sender, mut receiver) = socket.split();
    let mut outbound = UnboundedReceiverStream::new(rx);
    let send_task = tokio::spawn(async move {
        while let Some(event) = outbound.next().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        dispatch(&state, user_id, &display, &tx, &text).await;
    }

    send_task.abort();
    state.relay.registry.unregister(user_id, connection_id);
    presence::broadcast_online_roster(&state.relay.registry);
    info!(user = user_id.0, connection = %connection_id.0, "disconnected");
}

/// Single decision point for every inbound event. Handler errors become
/// scoped error events on the originating connection and never tear the
/// connection down.
async fn dispatch(
    state: &Arc<AppState>,
    user_id: UserId,
    display: &UserDisplay,
    tx: &mpsc::UnboundedSender<ServerEvent>,
    text: &str,
) {
    let request: ClientRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(_) => {
            let _ = tx.send(ServerEvent::Error(ApiError::new(
                ErrorCode::InvalidReference,
                "malformed event payload",
            )));
            return;
        }
    };

    let ctx = &state.relay;
    let outcome: Result<Option<ServerEvent>, ApiError> = match request {
        ClientRequest::JoinConversation { conversation_id } => {
            relay::confirm_membership(ctx, conversation_id, user_id)
                .await
                .map(|_| None)
        }
        // fan-out is registry-addressed, so leaving needs no transport effect
        ClientRequest::LeaveConversation { .. } => Ok(None),
        ClientRequest::SendMessage {
            conversation_id,
            text,
            media,
            reply_to,
            forwarded,
            forwarded_from,
        } => fanout::submit(
            ctx,
            conversation_id,
            user_id,
            fanout::NewMessage {
                text,
                media,
                reply_to,
                forwarded,
                forwarded_from,
                auto_generated: false,
            },
        )
        .await
        .map(|_| None),
        ClientRequest::EditMessage {
            message_id,
            new_text,
        } => sync::edit(ctx, message_id, user_id, &new_text)
            .await
            .map(|_| None),
        ClientRequest::DeleteMessage { message_id, scope } => match scope {
            DeleteScope::Everyone => sync::delete_for_everyone(ctx, message_id, user_id)
                .await
                .map(|_| None),
            DeleteScope::SelfOnly => sync::delete_for_me(ctx, message_id, user_id)
                .await
                .map(|_| None),
        },
        ClientRequest::ReactMessage { message_id, emoji } => {
            sync::react(ctx, message_id, user_id, &emoji)
                .await
                .map(|_| None)
        }
        ClientRequest::TypingStarted { conversation_id } => {
            typing::started(ctx, conversation_id, user_id, display)
                .await
                .map(|_| None)
        }
        ClientRequest::TypingStopped { conversation_id } => {
            typing::stopped(ctx, conversation_id, user_id)
                .await
                .map(|_| None)
        }
        ClientRequest::CallInitiate {
            recipient_id,
            media,
            conversation_id,
        } => calls::initiate(ctx, user_id, display, recipient_id, conversation_id, media)
            .await
            .map(Some),
        ClientRequest::CallAccept { caller_id } => calls::accept(ctx, user_id, display, caller_id)
            .await
            .map(|_| None),
        ClientRequest::CallReject { caller_id, reason } => {
            calls::reject(ctx, user_id, caller_id, reason)
                .await
                .map(|_| None)
        }
        ClientRequest::CallEnd { peer_id } => {
            calls::terminate(ctx, user_id, peer_id).await.map(|_| None)
        }
        ClientRequest::WebrtcOffer {
            recipient_id,
            payload,
        } => calls::relay_signal(ctx, SignalKind::Offer, user_id, recipient_id, payload)
            .await
            .map(|_| None),
        ClientRequest::WebrtcAnswer {
            recipient_id,
            payload,
        } => calls::relay_signal(ctx, SignalKind::Answer, user_id, recipient_id, payload)
            .await
            .map(|_| None),
        ClientRequest::WebrtcIceCandidate {
            recipient_id,
            payload,
        } => calls::relay_signal(ctx, SignalKind::IceCandidate, user_id, recipient_id, payload)
            .await
            .map(|_| None),
        ClientRequest::CallNoAnswer { recipient_id } => {
            calls::no_answer(ctx, user_id, display, recipient_id)
                .await
                .map(|_| None)
        }
        ClientRequest::CallBusy { caller_id } => {
            calls::busy(ctx, user_id, caller_id).await.map(|_| None)
        }
        ClientRequest::CallRecordEnd { call_id, reason } => {
            calls::record_end(ctx, call_id, reason).await.map(|_| None)
        }
    };

    match outcome {
        Ok(Some(ack)) => {
            let _ = tx.send(ack);
        }
        Ok(None) => {}
        Err(error) => {
            let _ = tx.send(ServerEvent::Error(error));
        }
    }
}
