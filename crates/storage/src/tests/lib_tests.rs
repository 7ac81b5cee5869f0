use super::*;

async fn setup() -> (Storage, UserId, UserId, ConversationId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage
        .create_user("alice", "alice@example.com")
        .await
        .expect("user");
    let bob = storage
        .create_user("bob", "bob@example.com")
        .await
        .expect("user");
    let conversation = storage
        .create_conversation(alice, &[alice, bob], false, None)
        .await
        .expect("conversation");
    (storage, alice, bob, conversation)
}

fn plain_text(conversation_id: ConversationId, sender_id: UserId, text: &str) -> NewStoredMessage {
    NewStoredMessage {
        conversation_id,
        sender_id,
        text: text.to_string(),
        media: Vec::new(),
        reply_to: None,
        forwarded: false,
        forwarded_from: None,
        auto_generated: false,
    }
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn participants_of_missing_conversation_is_none() {
    let (storage, ..) = setup().await;
    let absent = storage
        .participants_of(ConversationId(999))
        .await
        .expect("lookup");
    assert!(absent.is_none());
}

#[tokio::test]
async fn membership_reflects_participant_rows() {
    let (storage, alice, _bob, conversation) = setup().await;
    let carol = storage
        .create_user("carol", "carol@example.com")
        .await
        .expect("user");

    assert!(storage
        .is_participant(conversation, alice)
        .await
        .expect("check"));
    assert!(!storage
        .is_participant(conversation, carol)
        .await
        .expect("check"));
}

#[tokio::test]
async fn insert_message_moves_last_message_pointer() {
    let (storage, alice, _bob, conversation) = setup().await;
    let message = storage
        .insert_message(plain_text(conversation, alice, "hello"))
        .await
        .expect("message");

    let pointer: Option<i64> =
        sqlx::query_scalar("SELECT last_message_id FROM conversations WHERE id = ?")
            .bind(conversation.0)
            .fetch_one(storage.pool())
            .await
            .expect("pointer");
    assert_eq!(pointer, Some(message.message_id.0));
}

#[tokio::test]
async fn reaction_toggle_removes_same_emoji_and_replaces_different() {
    let (storage, alice, bob, conversation) = setup().await;
    let message = storage
        .insert_message(plain_text(conversation, alice, "react to me"))
        .await
        .expect("message");

    storage
        .toggle_reaction(message.message_id, bob, "👍")
        .await
        .expect("add");
    let stored = storage
        .find_message(message.message_id)
        .await
        .expect("find")
        .expect("some");
    assert_eq!(stored.reactions.len(), 1);
    assert_eq!(stored.reactions[0].emoji, "👍");

    storage
        .toggle_reaction(message.message_id, bob, "🎉")
        .await
        .expect("replace");
    let stored = storage
        .find_message(message.message_id)
        .await
        .expect("find")
        .expect("some");
    assert_eq!(stored.reactions.len(), 1);
    assert_eq!(stored.reactions[0].emoji, "🎉");

    storage
        .toggle_reaction(message.message_id, bob, "🎉")
        .await
        .expect("remove");
    let stored = storage
        .find_message(message.message_id)
        .await
        .expect("find")
        .expect("some");
    assert!(stored.reactions.is_empty());
}

#[tokio::test]
async fn one_reaction_slot_per_user() {
    let (storage, alice, bob, conversation) = setup().await;
    let message = storage
        .insert_message(plain_text(conversation, alice, "popular"))
        .await
        .expect("message");

    storage
        .toggle_reaction(message.message_id, alice, "👍")
        .await
        .expect("alice reacts");
    storage
        .toggle_reaction(message.message_id, bob, "👍")
        .await
        .expect("bob reacts");

    let stored = storage
        .find_message(message.message_id)
        .await
        .expect("find")
        .expect("some");
    assert_eq!(stored.reactions.len(), 2);

    storage
        .toggle_reaction(message.message_id, alice, "👍")
        .await
        .expect("alice retracts");
    let stored = storage
        .find_message(message.message_id)
        .await
        .expect("find")
        .expect("some");
    assert_eq!(stored.reactions.len(), 1);
    assert_eq!(stored.reactions[0].user_id, bob);
}

#[tokio::test]
async fn delete_marker_is_idempotent() {
    let (storage, alice, bob, conversation) = setup().await;
    let message = storage
        .insert_message(plain_text(conversation, alice, "private"))
        .await
        .expect("message");

    storage
        .add_delete_marker(message.message_id, bob)
        .await
        .expect("first");
    storage
        .add_delete_marker(message.message_id, bob)
        .await
        .expect("second");

    let markers: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM message_deletions WHERE message_id = ?")
            .bind(message.message_id.0)
            .fetch_one(storage.pool())
            .await
            .expect("count");
    assert_eq!(markers, 1);
}

#[tokio::test]
async fn blanking_clears_text_and_media_but_keeps_the_row() {
    let (storage, alice, _bob, conversation) = setup().await;
    let mut new = plain_text(conversation, alice, "regrettable");
    new.media.push(StoredMedia {
        url: "uploads/cat.png".to_string(),
        kind: MediaKind::Image,
    });
    let message = storage.insert_message(new).await.expect("message");

    storage
        .blank_message_for_everyone(message.message_id)
        .await
        .expect("blank");

    let stored = storage
        .find_message(message.message_id)
        .await
        .expect("find")
        .expect("row survives");
    assert!(stored.text.is_empty());
    assert!(stored.media.is_empty());
    assert!(stored.is_deleted_for_everyone);
}

#[tokio::test]
async fn recent_messages_come_back_oldest_first() {
    let (storage, alice, bob, conversation) = setup().await;
    for text in ["one", "two", "three"] {
        storage
            .insert_message(plain_text(conversation, alice, text))
            .await
            .expect("message");
    }
    storage
        .insert_message(plain_text(conversation, bob, "four"))
        .await
        .expect("message");

    let lines = storage
        .recent_messages(conversation, 3)
        .await
        .expect("history");
    let texts: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
    assert_eq!(texts, ["two", "three", "four"]);
    assert_eq!(lines[2].sender_name, "bob");
}

#[tokio::test]
async fn call_status_updates_are_guarded_by_the_lifecycle() {
    let (storage, alice, bob, _conversation) = setup().await;
    let call = storage
        .create_call(alice, bob, CallMedia::Voice)
        .await
        .expect("call");

    // ringing -> ended skips connected and must be refused
    let refused = storage
        .record_call_end(call, CallEndReason::Completed)
        .await
        .expect("attempt");
    assert_eq!(
        refused,
        CallTransition::Refused {
            from: CallStatus::Ringing
        }
    );

    let applied = storage
        .update_call_status(call, CallStatus::Connected)
        .await
        .expect("connect");
    assert_eq!(
        applied,
        CallTransition::Applied {
            from: CallStatus::Ringing
        }
    );

    let ended = storage
        .record_call_end(call, CallEndReason::Completed)
        .await
        .expect("end");
    assert_eq!(
        ended,
        CallTransition::Applied {
            from: CallStatus::Connected
        }
    );

    let stored = storage.find_call(call).await.expect("find").expect("some");
    assert_eq!(stored.status, CallStatus::Ended);
    assert_eq!(stored.end_reason, Some(CallEndReason::Completed));
    assert!(stored.ended_at.is_some());

    // terminal states accept nothing further
    let stuck = storage
        .update_call_status(call, CallStatus::Connected)
        .await
        .expect("attempt");
    assert_eq!(
        stuck,
        CallTransition::Refused {
            from: CallStatus::Ended
        }
    );
}

#[tokio::test]
async fn latest_ringing_call_ignores_settled_sessions() {
    let (storage, alice, bob, _conversation) = setup().await;
    let first = storage
        .create_call(alice, bob, CallMedia::Video)
        .await
        .expect("call");
    storage
        .update_call_status(first, CallStatus::Missed)
        .await
        .expect("miss");
    let second = storage
        .create_call(alice, bob, CallMedia::Video)
        .await
        .expect("call");

    let latest = storage
        .latest_ringing_call(alice, bob)
        .await
        .expect("lookup");
    assert_eq!(latest, Some(second));

    let none = storage
        .latest_ringing_call(bob, alice)
        .await
        .expect("lookup");
    assert!(none.is_none());
}

#[tokio::test]
async fn auto_reply_settings_round_trip() {
    let (storage, alice, ..) = setup().await;
    let defaults = storage
        .auto_reply_settings(alice)
        .await
        .expect("settings")
        .expect("some");
    assert!(!defaults.enabled);
    assert_eq!(defaults.tone, AutoReplyTone::Friendly);

    storage
        .set_auto_reply(alice, true, AutoReplyTone::Funny)
        .await
        .expect("update");
    let updated = storage
        .auto_reply_settings(alice)
        .await
        .expect("settings")
        .expect("some");
    assert!(updated.enabled);
    assert_eq!(updated.tone, AutoReplyTone::Funny);
}
