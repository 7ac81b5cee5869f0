use anyhow::{anyhow, Result};
use shared::domain::{ConversationId, UserId};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{
    fanout::{self, NewMessage},
    generator::ReplyContext,
    RelayContext,
};

/// How many conversation lines the generator gets to see.
const HISTORY_LIMIT: u32 = 5;

/// Fire-and-forget: requests a generated reply for an unreachable, opted-in
/// recipient, waits out the fixed delay, and re-enters the fan-out path with
/// the recipient as sender. Generation failure drops the reply; nothing is
/// retried. The scheduled reply is delivered even if the recipient reconnects
/// during the delay window.
pub fn schedule(
    ctx: RelayContext,
    recipient_id: UserId,
    conversation_id: ConversationId,
    last_message_text: String,
) {
    tokio::spawn(async move {
        if let Err(error) = run(&ctx, recipient_id, conversation_id, last_message_text).await {
            warn!(
                recipient = recipient_id.0,
                conversation = conversation_id.0,
                %error,
                "auto-reply dropped"
            );
        }
    });
}

async fn run(
    ctx: &RelayContext,
    recipient_id: UserId,
    conversation_id: ConversationId,
    last_message_text: String,
) -> Result<()> {
    // settings may have changed since fan-out scheduled us
    let Some(settings) = ctx.storage.auto_reply_settings(recipient_id).await? else {
        return Ok(());
    };
    if !settings.enabled {
        return Ok(());
    }
    let Some(display) = ctx.storage.user_display(recipient_id).await? else {
        return Ok(());
    };

    let history = ctx
        .storage
        .recent_messages(conversation_id, HISTORY_LIMIT)
        .await?;
    let context = ReplyContext {
        recipient_name: display.name,
        tone: settings.tone,
        history,
        last_message: last_message_text,
    };

    let text = match ctx.generator.generate(&context).await {
        Ok(text) => text,
        Err(error) => {
            // recovered locally: no reply is produced
            warn!(recipient = recipient_id.0, %error, "reply generation failed");
            return Ok(());
        }
    };

    sleep(ctx.auto_reply_delay).await;

    let payload = fanout::submit(
        ctx,
        conversation_id,
        recipient_id,
        NewMessage {
            text,
            auto_generated: true,
            ..NewMessage::default()
        },
    )
    .await
    .map_err(|error| anyhow!("auto-reply fan-out failed: {}", error.message))?;
    debug!(
        recipient = recipient_id.0,
        message = payload.message_id.0,
        "auto-reply delivered"
    );
    Ok(())
}
