use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{
    AutoReplyTone, CallEndReason, CallId, CallMedia, CallStatus, ConversationId, MediaKind,
    MessageId, UserDisplay, UserId,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub text: String,
    pub media: Vec<StoredMedia>,
    pub reply_to: Option<MessageId>,
    pub forwarded: bool,
    pub forwarded_from: Option<UserId>,
    pub reactions: Vec<StoredReaction>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted_for_everyone: bool,
    pub auto_generated: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredMedia {
    pub url: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone)]
pub struct StoredReaction {
    pub user_id: UserId,
    pub emoji: String,
}

#[derive(Debug, Clone)]
pub struct NewStoredMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub text: String,
    pub media: Vec<StoredMedia>,
    pub reply_to: Option<MessageId>,
    pub forwarded: bool,
    pub forwarded_from: Option<UserId>,
    pub auto_generated: bool,
}

#[derive(Debug, Clone)]
pub struct StoredCall {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub recipient_id: UserId,
    pub media: CallMedia,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<CallEndReason>,
}

#[derive(Debug, Clone, Copy)]
pub struct AutoReplySettings {
    pub enabled: bool,
    pub tone: AutoReplyTone,
}

/// One line of conversation history handed to the reply generator.
#[derive(Debug, Clone)]
pub struct ConversationLine {
    pub sender_name: String,
    pub text: String,
}

/// Outcome of a guarded call-status update. The store refuses transitions the
/// lifecycle does not allow instead of clobbering terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    Applied { from: CallStatus },
    Refused { from: CallStatus },
    NotFound,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, name: &str, email: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (name, email) VALUES (?, ?)
             ON CONFLICT(email) DO UPDATE SET name=excluded.name
             RETURNING id",
        )
        .bind(name)
        .bind(email)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn user_display(&self, user_id: UserId) -> Result<Option<UserDisplay>> {
        let row = sqlx::query("SELECT name, avatar_url FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| UserDisplay {
            name: r.get::<String, _>(0),
            avatar_url: r.get::<String, _>(1),
        }))
    }

    pub async fn set_auto_reply(
        &self,
        user_id: UserId,
        enabled: bool,
        tone: AutoReplyTone,
    ) -> Result<()> {
        sqlx::query("UPDATE users SET auto_reply_enabled = ?, auto_reply_tone = ? WHERE id = ?")
            .bind(enabled)
            .bind(tone_to_str(tone))
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn auto_reply_settings(&self, user_id: UserId) -> Result<Option<AutoReplySettings>> {
        let row = sqlx::query("SELECT auto_reply_enabled, auto_reply_tone FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok(AutoReplySettings {
                enabled: r.get::<bool, _>(0),
                tone: tone_from_str(&r.get::<String, _>(1))?,
            })
        })
        .transpose()
    }

    pub async fn create_conversation(
        &self,
        created_by: UserId,
        participants: &[UserId],
        is_group: bool,
        group_name: Option<&str>,
    ) -> Result<ConversationId> {
        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO conversations (is_group, group_name, created_by) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(is_group)
        .bind(group_name)
        .bind(created_by.0)
        .fetch_one(&mut *tx)
        .await?;
        let conversation_id = ConversationId(rec.get::<i64, _>(0));

        for participant in participants {
            sqlx::query(
                "INSERT OR IGNORE INTO participants (conversation_id, user_id, is_admin) VALUES (?, ?, ?)",
            )
            .bind(conversation_id.0)
            .bind(participant.0)
            .bind(is_group && *participant == created_by)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(conversation_id)
    }

    /// MembershipOracle query: participant set of a conversation, or None if
    /// the conversation does not exist. Re-read on every event because
    /// membership can change concurrently.
    pub async fn participants_of(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Vec<UserId>>> {
        let exists = sqlx::query("SELECT id FROM conversations WHERE id = ?")
            .bind(conversation_id.0)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Ok(None);
        }

        let rows = sqlx::query("SELECT user_id FROM participants WHERE conversation_id = ?")
            .bind(conversation_id.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(Some(
            rows.into_iter().map(|r| UserId(r.get::<i64, _>(0))).collect(),
        ))
    }

    pub async fn is_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM participants WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Persists a message and moves the conversation's last-message pointer in
    /// the same transaction.
    pub async fn insert_message(&self, new: NewStoredMessage) -> Result<StoredMessage> {
        let created_at = Utc::now();
        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO messages (conversation_id, sender_id, text, reply_to, forwarded, forwarded_from, auto_generated, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(new.conversation_id.0)
        .bind(new.sender_id.0)
        .bind(&new.text)
        .bind(new.reply_to.map(|id| id.0))
        .bind(new.forwarded)
        .bind(new.forwarded_from.map(|id| id.0))
        .bind(new.auto_generated)
        .bind(created_at)
        .fetch_one(&mut *tx)
        .await?;
        let message_id = MessageId(rec.get::<i64, _>(0));

        for media in &new.media {
            sqlx::query("INSERT INTO message_media (message_id, url, kind) VALUES (?, ?, ?)")
                .bind(message_id.0)
                .bind(&media.url)
                .bind(media_kind_to_str(media.kind))
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("UPDATE conversations SET last_message_id = ? WHERE id = ?")
            .bind(message_id.0)
            .bind(new.conversation_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(StoredMessage {
            message_id,
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            text: new.text,
            media: new.media,
            reply_to: new.reply_to,
            forwarded: new.forwarded,
            forwarded_from: new.forwarded_from,
            reactions: Vec::new(),
            is_edited: false,
            edited_at: None,
            is_deleted_for_everyone: false,
            auto_generated: new.auto_generated,
            created_at,
        })
    }

    pub async fn find_message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT id, conversation_id, sender_id, text, reply_to, forwarded, forwarded_from,
                    is_edited, edited_at, is_deleted_for_everyone, auto_generated, created_at
             FROM messages WHERE id = ?",
        )
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        let Some(r) = row else {
            return Ok(None);
        };

        let media = sqlx::query("SELECT url, kind FROM message_media WHERE message_id = ?")
            .bind(message_id.0)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|m| {
                Ok(StoredMedia {
                    url: m.get::<String, _>(0),
                    kind: media_kind_from_str(&m.get::<String, _>(1))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let reactions = sqlx::query(
            "SELECT user_id, emoji FROM message_reactions WHERE message_id = ? ORDER BY user_id ASC",
        )
        .bind(message_id.0)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|m| StoredReaction {
            user_id: UserId(m.get::<i64, _>(0)),
            emoji: m.get::<String, _>(1),
        })
        .collect();

        Ok(Some(StoredMessage {
            message_id: MessageId(r.get::<i64, _>(0)),
            conversation_id: ConversationId(r.get::<i64, _>(1)),
            sender_id: UserId(r.get::<i64, _>(2)),
            text: r.get::<String, _>(3),
            media,
            reply_to: r.get::<Option<i64>, _>(4).map(MessageId),
            forwarded: r.get::<bool, _>(5),
            forwarded_from: r.get::<Option<i64>, _>(6).map(UserId),
            reactions,
            is_edited: r.get::<bool, _>(7),
            edited_at: r.get::<Option<DateTime<Utc>>, _>(8),
            is_deleted_for_everyone: r.get::<bool, _>(9),
            auto_generated: r.get::<bool, _>(10),
            created_at: r.get::<DateTime<Utc>, _>(11),
        }))
    }

    pub async fn update_message_text(&self, message_id: MessageId, new_text: &str) -> Result<()> {
        sqlx::query("UPDATE messages SET text = ?, is_edited = 1, edited_at = ? WHERE id = ?")
            .bind(new_text)
            .bind(Utc::now())
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete-for-everyone policy: content is blanked in place and the row
    /// survives so reply and forward references stay resolvable.
    pub async fn blank_message_for_everyone(&self, message_id: MessageId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE messages SET text = '', is_deleted_for_everyone = 1, deleted_at = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(message_id.0)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM message_media WHERE message_id = ?")
            .bind(message_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Idempotent: marking a message deleted twice for the same user is a
    /// no-op.
    pub async fn add_delete_marker(&self, message_id: MessageId, user_id: UserId) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO message_deletions (message_id, user_id) VALUES (?, ?)")
            .bind(message_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Toggle semantics, serialized per message by the transaction: same emoji
    /// removes the user's reaction, a different emoji replaces it, absence
    /// adds it. The primary key keeps at most one reaction per user.
    pub async fn toggle_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query(
            "SELECT emoji FROM message_reactions WHERE message_id = ? AND user_id = ?",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .fetch_optional(&mut *tx)
        .await?;

        match existing {
            Some(row) if row.get::<String, _>(0) == emoji => {
                sqlx::query("DELETE FROM message_reactions WHERE message_id = ? AND user_id = ?")
                    .bind(message_id.0)
                    .bind(user_id.0)
                    .execute(&mut *tx)
                    .await?;
            }
            Some(_) => {
                sqlx::query(
                    "UPDATE message_reactions SET emoji = ? WHERE message_id = ? AND user_id = ?",
                )
                .bind(emoji)
                .bind(message_id.0)
                .bind(user_id.0)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query(
                    "INSERT INTO message_reactions (message_id, user_id, emoji) VALUES (?, ?, ?)",
                )
                .bind(message_id.0)
                .bind(user_id.0)
                .bind(emoji)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Last `limit` visible messages of a conversation, oldest first, joined
    /// with sender names. Context for the reply generator.
    pub async fn recent_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
    ) -> Result<Vec<ConversationLine>> {
        let mut rows = sqlx::query(
            "SELECT u.name, m.text
             FROM messages m
             INNER JOIN users u ON u.id = m.sender_id
             WHERE m.conversation_id = ? AND m.is_deleted_for_everyone = 0
             ORDER BY m.id DESC
             LIMIT ?",
        )
        .bind(conversation_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.reverse();
        Ok(rows
            .into_iter()
            .map(|r| ConversationLine {
                sender_name: r.get::<String, _>(0),
                text: r.get::<String, _>(1),
            })
            .collect())
    }

    pub async fn create_call(
        &self,
        caller_id: UserId,
        recipient_id: UserId,
        media: CallMedia,
    ) -> Result<CallId> {
        let rec = sqlx::query(
            "INSERT INTO calls (caller_id, recipient_id, media, status, started_at)
             VALUES (?, ?, ?, 'ringing', ?) RETURNING id",
        )
        .bind(caller_id.0)
        .bind(recipient_id.0)
        .bind(call_media_to_str(media))
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(CallId(rec.get::<i64, _>(0)))
    }

    pub async fn find_call(&self, call_id: CallId) -> Result<Option<StoredCall>> {
        let row = sqlx::query(
            "SELECT id, caller_id, recipient_id, media, status, started_at, ended_at, end_reason
             FROM calls WHERE id = ?",
        )
        .bind(call_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(StoredCall {
                call_id: CallId(r.get::<i64, _>(0)),
                caller_id: UserId(r.get::<i64, _>(1)),
                recipient_id: UserId(r.get::<i64, _>(2)),
                media: call_media_from_str(&r.get::<String, _>(3))?,
                status: call_status_from_str(&r.get::<String, _>(4))?,
                started_at: r.get::<DateTime<Utc>, _>(5),
                ended_at: r.get::<Option<DateTime<Utc>>, _>(6),
                end_reason: r
                    .get::<Option<String>, _>(7)
                    .map(|raw| end_reason_from_str(&raw))
                    .transpose()?,
            })
        })
        .transpose()
    }

    /// Most recent still-ringing session for a caller/recipient pair. Used by
    /// the signaling handlers to settle the session best-effort.
    pub async fn latest_ringing_call(
        &self,
        caller_id: UserId,
        recipient_id: UserId,
    ) -> Result<Option<CallId>> {
        let row = sqlx::query(
            "SELECT id FROM calls
             WHERE caller_id = ? AND recipient_id = ? AND status = 'ringing'
             ORDER BY id DESC LIMIT 1",
        )
        .bind(caller_id.0)
        .bind(recipient_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| CallId(r.get::<i64, _>(0))))
    }

    /// Guarded read-modify-write of a call's status. The current status is
    /// read and validated inside one transaction so two concurrent handlers
    /// cannot both settle the same ringing session.
    pub async fn update_call_status(
        &self,
        call_id: CallId,
        next: CallStatus,
    ) -> Result<CallTransition> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT status FROM calls WHERE id = ?")
            .bind(call_id.0)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(CallTransition::NotFound);
        };
        let from = call_status_from_str(&row.get::<String, _>(0))?;
        if !from.can_transition_to(next) {
            return Ok(CallTransition::Refused { from });
        }

        sqlx::query("UPDATE calls SET status = ? WHERE id = ?")
            .bind(call_status_to_str(next))
            .bind(call_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(CallTransition::Applied { from })
    }

    /// The only operation moving `connected` into `ended`; stamps end time
    /// and reason.
    pub async fn record_call_end(
        &self,
        call_id: CallId,
        reason: CallEndReason,
    ) -> Result<CallTransition> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT status FROM calls WHERE id = ?")
            .bind(call_id.0)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(CallTransition::NotFound);
        };
        let from = call_status_from_str(&row.get::<String, _>(0))?;
        if !from.can_transition_to(CallStatus::Ended) {
            return Ok(CallTransition::Refused { from });
        }

        sqlx::query("UPDATE calls SET status = 'ended', ended_at = ?, end_reason = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(end_reason_to_str(reason))
            .bind(call_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(CallTransition::Applied { from })
    }
}

fn media_kind_to_str(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "image",
        MediaKind::Video => "video",
        MediaKind::Audio => "audio",
        MediaKind::File => "file",
    }
}

fn media_kind_from_str(raw: &str) -> Result<MediaKind> {
    Ok(match raw {
        "image" => MediaKind::Image,
        "video" => MediaKind::Video,
        "audio" => MediaKind::Audio,
        "file" => MediaKind::File,
        other => bail!("unknown media kind '{other}'"),
    })
}

fn call_media_to_str(media: CallMedia) -> &'static str {
    match media {
        CallMedia::Voice => "voice",
        CallMedia::Video => "video",
    }
}

fn call_media_from_str(raw: &str) -> Result<CallMedia> {
    Ok(match raw {
        "voice" => CallMedia::Voice,
        "video" => CallMedia::Video,
        other => bail!("unknown call media '{other}'"),
    })
}

fn call_status_to_str(status: CallStatus) -> &'static str {
    match status {
        CallStatus::Ringing => "ringing",
        CallStatus::Connected => "connected",
        CallStatus::Ended => "ended",
        CallStatus::Missed => "missed",
        CallStatus::Rejected => "rejected",
        CallStatus::Cancelled => "cancelled",
    }
}

fn call_status_from_str(raw: &str) -> Result<CallStatus> {
    Ok(match raw {
        "ringing" => CallStatus::Ringing,
        "connected" => CallStatus::Connected,
        "ended" => CallStatus::Ended,
        "missed" => CallStatus::Missed,
        "rejected" => CallStatus::Rejected,
        "cancelled" => CallStatus::Cancelled,
        other => bail!("unknown call status '{other}'"),
    })
}

fn end_reason_to_str(reason: CallEndReason) -> &'static str {
    match reason {
        CallEndReason::Completed => "completed",
        CallEndReason::Cancelled => "cancelled",
        CallEndReason::Missed => "missed",
        CallEndReason::Error => "error",
    }
}

fn end_reason_from_str(raw: &str) -> Result<CallEndReason> {
    Ok(match raw {
        "completed" => CallEndReason::Completed,
        "cancelled" => CallEndReason::Cancelled,
        "missed" => CallEndReason::Missed,
        "error" => CallEndReason::Error,
        other => bail!("unknown end reason '{other}'"),
    })
}

fn tone_to_str(tone: AutoReplyTone) -> &'static str {
    match tone {
        AutoReplyTone::Friendly => "friendly",
        AutoReplyTone::Professional => "professional",
        AutoReplyTone::Funny => "funny",
    }
}

fn tone_from_str(raw: &str) -> Result<AutoReplyTone> {
    Ok(match raw {
        "friendly" => AutoReplyTone::Friendly,
        "professional" => AutoReplyTone::Professional,
        "funny" => AutoReplyTone::Funny,
        other => bail!("unknown auto-reply tone '{other}'"),
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return Ok(());
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if path.is_empty() {
        return Ok(());
    }

    let path: PathBuf = Path::new(path).to_path_buf();
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory for '{database_url}'"))?;
    Ok(())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
