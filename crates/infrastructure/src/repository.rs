use application::{ConversationStore, ReadOutcome};
use async_trait::async_trait;
use domain::{
    AttachmentUrl, Conversation, ConversationId, LastMessage, Message, MessageContent,
    MessageDraft, MessageId, ParticipantPair, ParticipantState, Receipt, RepositoryError,
    Timestamp, UserId,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    match &err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => RepositoryError::unavailable(err.to_string()),
        sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict,
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        _ => RepositoryError::storage(err.to_string()),
    }
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

fn to_i64(value: u64) -> Result<i64, RepositoryError> {
    i64::try_from(value).map_err(|_| invalid_data(format!("{value} does not fit in BIGINT")))
}

fn to_u64(value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| invalid_data(format!("negative sequence {value}")))
}

#[derive(Debug, FromRow)]
struct ConversationRecord {
    id: Uuid,
    participant_low: Uuid,
    participant_high: Uuid,
    last_sequence: i64,
    last_message_id: Option<Uuid>,
    last_message_sender_id: Option<Uuid>,
    last_message_content: Option<String>,
    last_message_sequence: Option<i64>,
    last_message_at: Option<OffsetDateTime>,
    last_activity: OffsetDateTime,
    created_at: OffsetDateTime,
}

#[derive(Debug, FromRow)]
struct ParticipantRecord {
    conversation_id: Uuid,
    user_id: Uuid,
    unread_count: i32,
    last_read_at: Option<OffsetDateTime>,
}

impl TryFrom<&ParticipantRecord> for ParticipantState {
    type Error = RepositoryError;

    fn try_from(value: &ParticipantRecord) -> Result<Self, Self::Error> {
        Ok(ParticipantState {
            user_id: UserId::from(value.user_id),
            unread_count: u32::try_from(value.unread_count)
                .map_err(|_| invalid_data("negative unread count"))?,
            last_read_at: value.last_read_at,
        })
    }
}

/// 会话行与两条参与者行拼成领域对象
fn assemble(
    record: ConversationRecord,
    participants: &[ParticipantRecord],
) -> Result<Conversation, RepositoryError> {
    let state_of = |user_id: Uuid| -> Result<ParticipantState, RepositoryError> {
        participants
            .iter()
            .find(|p| p.conversation_id == record.id && p.user_id == user_id)
            .ok_or_else(|| invalid_data(format!("conversation {} lacks participant {user_id}", record.id)))
            .and_then(ParticipantState::try_from)
    };
    let low = state_of(record.participant_low)?;
    let high = state_of(record.participant_high)?;

    let last_message = match (
        record.last_message_id,
        record.last_message_sender_id,
        record.last_message_content,
        record.last_message_sequence,
        record.last_message_at,
    ) {
        (Some(message_id), Some(sender_id), Some(content), Some(sequence), Some(created_at)) => {
            Some(LastMessage {
                message_id: MessageId::from(message_id),
                sender_id: UserId::from(sender_id),
                content: MessageContent::from_stored(content),
                sequence: to_u64(sequence)?,
                created_at,
            })
        }
        (None, None, None, None, None) => None,
        _ => return Err(invalid_data("partially written last message")),
    };

    Ok(Conversation {
        id: ConversationId::from(record.id),
        participants: [low, high],
        last_message,
        last_sequence: to_u64(record.last_sequence)?,
        last_activity: record.last_activity,
        created_at: record.created_at,
    })
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: Uuid,
    conversation_id: Uuid,
    sender_id: Uuid,
    recipient_id: Uuid,
    content: String,
    attachments: Vec<String>,
    sequence: i64,
    created_at: OffsetDateTime,
    delivered_at: Option<OffsetDateTime>,
    read_at: Option<OffsetDateTime>,
}

impl TryFrom<MessageRecord> for Message {
    type Error = RepositoryError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        Ok(Message {
            id: MessageId::from(value.id),
            conversation_id: ConversationId::from(value.conversation_id),
            sender_id: UserId::from(value.sender_id),
            content: MessageContent::from_stored(value.content),
            attachments: value
                .attachments
                .into_iter()
                .map(AttachmentUrl::from_stored)
                .collect(),
            sequence: to_u64(value.sequence)?,
            created_at: value.created_at,
            receipt: Receipt {
                recipient_id: UserId::from(value.recipient_id),
                delivered_at: value.delivered_at,
                read_at: value.read_at,
            },
        })
    }
}

#[derive(Clone)]
pub struct PgConversationStore {
    pool: PgPool,
}

impl PgConversationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn participants_of<'e, E>(
        executor: E,
        ids: &[Uuid],
    ) -> Result<Vec<ParticipantRecord>, RepositoryError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        sqlx::query_as::<_, ParticipantRecord>(
            r#"
            SELECT conversation_id, user_id, unread_count, last_read_at
            FROM conversation_participants
            WHERE conversation_id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(executor)
        .await
        .map_err(map_sqlx_err)
    }

    /// 在事务内锁住会话行并读出完整会话，同一会话的写入因此串行
    async fn lock_conversation(
        tx: &mut Transaction<'_, Postgres>,
        id: ConversationId,
    ) -> Result<Conversation, RepositoryError> {
        let record = sqlx::query_as::<_, ConversationRecord>(
            r#"
            SELECT id, participant_low, participant_high, last_sequence,
                   last_message_id, last_message_sender_id, last_message_content,
                   last_message_sequence, last_message_at, last_activity, created_at
            FROM conversations
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_sqlx_err)?
        .ok_or(RepositoryError::NotFound)?;

        let participants = Self::participants_of(&mut **tx, &[record.id]).await?;
        assemble(record, &participants)
    }

    async fn save_summary(
        tx: &mut Transaction<'_, Postgres>,
        conversation: &Conversation,
    ) -> Result<(), RepositoryError> {
        let last = conversation.last_message.as_ref();
        let last_sequence = last.map(|m| to_i64(m.sequence)).transpose()?;
        sqlx::query(
            r#"
            UPDATE conversations
            SET last_sequence = $2,
                last_message_id = $3,
                last_message_sender_id = $4,
                last_message_content = $5,
                last_message_sequence = $6,
                last_message_at = $7,
                last_activity = $8
            WHERE id = $1
            "#,
        )
        .bind(conversation.id.as_uuid())
        .bind(to_i64(conversation.last_sequence)?)
        .bind(last.map(|m| m.message_id.as_uuid()))
        .bind(last.map(|m| m.sender_id.as_uuid()))
        .bind(last.map(|m| m.content.as_str().to_string()))
        .bind(last_sequence)
        .bind(last.map(|m| m.created_at))
        .bind(conversation.last_activity)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_err)?;

        for participant in &conversation.participants {
            Self::save_participant(tx, conversation.id, participant).await?;
        }
        Ok(())
    }

    async fn save_participant(
        tx: &mut Transaction<'_, Postgres>,
        conversation_id: ConversationId,
        participant: &ParticipantState,
    ) -> Result<(), RepositoryError> {
        let unread = i32::try_from(participant.unread_count).unwrap_or(i32::MAX);
        sqlx::query(
            r#"
            UPDATE conversation_participants
            SET unread_count = $3, last_read_at = $4
            WHERE conversation_id = $1 AND user_id = $2
            "#,
        )
        .bind(conversation_id.as_uuid())
        .bind(participant.user_id.as_uuid())
        .bind(unread)
        .bind(participant.last_read_at)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn find_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let record = sqlx::query_as::<_, ConversationRecord>(
            r#"
            SELECT id, participant_low, participant_high, last_sequence,
                   last_message_id, last_message_sender_id, last_message_content,
                   last_message_sequence, last_message_at, last_activity, created_at
            FROM conversations
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        match record {
            Some(record) => {
                let participants = Self::participants_of(&self.pool, &[record.id]).await?;
                assemble(record, &participants).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn find_by_participants(
        &self,
        pair: ParticipantPair,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let record = sqlx::query_as::<_, ConversationRecord>(
            r#"
            SELECT id, participant_low, participant_high, last_sequence,
                   last_message_id, last_message_sender_id, last_message_content,
                   last_message_sequence, last_message_at, last_activity, created_at
            FROM conversations
            WHERE participant_low = $1 AND participant_high = $2
            "#,
        )
        .bind(pair.first().as_uuid())
        .bind(pair.second().as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        match record {
            Some(record) => {
                let participants = Self::participants_of(&self.pool, &[record.id]).await?;
                assemble(record, &participants).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn get_or_create_conversation(
        &self,
        candidate: Conversation,
    ) -> Result<(Conversation, bool), RepositoryError> {
        let pair = candidate.pair();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        // 并发创建同一对用户的会话时，后到者在唯一约束上等待先到者提交，然后什么也不做
        let inserted = sqlx::query(
            r#"
            INSERT INTO conversations (id, participant_low, participant_high, last_sequence, last_activity, created_at)
            VALUES ($1, $2, $3, 0, $4, $5)
            ON CONFLICT (participant_low, participant_high) DO NOTHING
            "#,
        )
        .bind(candidate.id.as_uuid())
        .bind(pair.first().as_uuid())
        .bind(pair.second().as_uuid())
        .bind(candidate.last_activity)
        .bind(candidate.created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?
        .rows_affected();

        if inserted == 1 {
            sqlx::query(
                r#"
                INSERT INTO conversation_participants (conversation_id, user_id, unread_count)
                VALUES ($1, $2, 0), ($1, $3, 0)
                "#,
            )
            .bind(candidate.id.as_uuid())
            .bind(pair.first().as_uuid())
            .bind(pair.second().as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
            tx.commit().await.map_err(map_sqlx_err)?;
            return Ok((candidate, true));
        }

        tx.commit().await.map_err(map_sqlx_err)?;
        let existing = self
            .find_by_participants(pair)
            .await?
            .ok_or_else(|| invalid_data("conversation vanished after conflict"))?;
        Ok((existing, false))
    }

    async fn list_conversations_for(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Conversation>, RepositoryError> {
        let records = sqlx::query_as::<_, ConversationRecord>(
            r#"
            SELECT c.id, c.participant_low, c.participant_high, c.last_sequence,
                   c.last_message_id, c.last_message_sender_id, c.last_message_content,
                   c.last_message_sequence, c.last_message_at, c.last_activity, c.created_at
            FROM conversations c
            JOIN conversation_participants p ON p.conversation_id = c.id
            WHERE p.user_id = $1
            ORDER BY c.last_activity DESC, c.id
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if records.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        let participants = Self::participants_of(&self.pool, &ids).await?;

        records
            .into_iter()
            .map(|record| assemble(record, &participants))
            .collect()
    }

    async fn append_message(
        &self,
        draft: MessageDraft,
    ) -> Result<(Message, Conversation), RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        let mut conversation = Self::lock_conversation(&mut tx, draft.conversation_id).await?;
        let message = conversation
            .accept(draft)
            .map_err(|err| invalid_data(err.to_string()))?;

        let attachments: Vec<String> = message
            .attachments
            .iter()
            .map(|a| a.as_str().to_string())
            .collect();
        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, sender_id, recipient_id, content, attachments, sequence, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(message.id.as_uuid())
        .bind(message.conversation_id.as_uuid())
        .bind(message.sender_id.as_uuid())
        .bind(message.recipient_id().as_uuid())
        .bind(message.content.as_str())
        .bind(&attachments)
        .bind(to_i64(message.sequence)?)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        Self::save_summary(&mut tx, &conversation).await?;
        tx.commit().await.map_err(map_sqlx_err)?;
        Ok((message, conversation))
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        after_sequence: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Message>, RepositoryError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let records = match after_sequence {
            Some(after) => {
                sqlx::query_as::<_, MessageRecord>(
                    r#"
                    SELECT id, conversation_id, sender_id, recipient_id, content, attachments,
                           sequence, created_at, delivered_at, read_at
                    FROM messages
                    WHERE conversation_id = $1 AND sequence > $2
                    ORDER BY sequence ASC
                    LIMIT $3
                    "#,
                )
                .bind(conversation_id.as_uuid())
                .bind(to_i64(after)?)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, MessageRecord>(
                    r#"
                    SELECT * FROM (
                        SELECT id, conversation_id, sender_id, recipient_id, content, attachments,
                               sequence, created_at, delivered_at, read_at
                        FROM messages
                        WHERE conversation_id = $1
                        ORDER BY sequence DESC
                        LIMIT $2
                    ) AS newest
                    ORDER BY sequence ASC
                    "#,
                )
                .bind(conversation_id.as_uuid())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Message::try_from).collect()
    }

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
        at: Timestamp,
    ) -> Result<ReadOutcome, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        let mut conversation = Self::lock_conversation(&mut tx, conversation_id).await?;
        let unread_cleared = conversation
            .mark_read(reader_id, at)
            .map_err(|err| invalid_data(err.to_string()))?;

        let messages_marked = sqlx::query(
            r#"
            UPDATE messages
            SET read_at = $3, delivered_at = COALESCE(delivered_at, $3)
            WHERE conversation_id = $1 AND recipient_id = $2 AND read_at IS NULL
            "#,
        )
        .bind(conversation_id.as_uuid())
        .bind(reader_id.as_uuid())
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?
        .rows_affected();

        if unread_cleared {
            if let Some(participant) = conversation.participant(reader_id) {
                Self::save_participant(&mut tx, conversation_id, participant).await?;
            }
        }
        tx.commit().await.map_err(map_sqlx_err)?;

        Ok(ReadOutcome {
            conversation,
            messages_marked,
            changed: unread_cleared || messages_marked > 0,
        })
    }

    async fn mark_delivered(
        &self,
        conversation_id: ConversationId,
        recipient_id: UserId,
        up_to_sequence: u64,
        at: Timestamp,
    ) -> Result<u64, RepositoryError> {
        let changed = sqlx::query(
            r#"
            UPDATE messages
            SET delivered_at = $4
            WHERE conversation_id = $1
              AND recipient_id = $2
              AND sequence <= $3
              AND delivered_at IS NULL
            "#,
        )
        .bind(conversation_id.as_uuid())
        .bind(recipient_id.as_uuid())
        .bind(to_i64(up_to_sequence)?)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?
        .rows_affected();
        Ok(changed)
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
