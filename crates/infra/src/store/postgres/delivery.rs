use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use tracing::{Span, instrument};
use uuid::Uuid;

use busline_core::{
    ConcurrencyToken, JobId, MessageId, MessageTypeId, PublisherInstanceId, SubscriberId,
    TicketId, TicketState, TicketUpdate,
};

use super::{
    PostgresBusStore, bind_queue, is_unique_violation, map_sqlx_error, retry_count_column,
    ticket_table,
};
use crate::store::model::{
    ClaimOutcome, ClaimedDelivery, CommitOutcome, Consumer, DeliveryTicket, Message,
    PublishReceipt, QueueDepth, QueueRef, TicketKind, reclaim_cutoff,
};
use crate::store::r#trait::{DeliveryStore, StoreError, StoreResult, validate_targets, expect_one};

const MESSAGE_COLUMNS: &str = "m.id_message, m.id_message_type, m.id_publisher_instance, \
                               m.id_previous_message, m.created_utc, m.valid_to_utc, \
                               m.is_recovery, m.data";

#[derive(Debug)]
struct MessageRow {
    id_message: Uuid,
    id_message_type: i32,
    id_publisher_instance: Uuid,
    id_previous_message: Option<Uuid>,
    created_utc: DateTime<Utc>,
    valid_to_utc: Option<DateTime<Utc>>,
    is_recovery: bool,
    data: Vec<u8>,
}

impl<'r> FromRow<'r, PgRow> for MessageRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(MessageRow {
            id_message: row.try_get("id_message")?,
            id_message_type: row.try_get("id_message_type")?,
            id_publisher_instance: row.try_get("id_publisher_instance")?,
            id_previous_message: row.try_get("id_previous_message")?,
            created_utc: row.try_get("created_utc")?,
            valid_to_utc: row.try_get("valid_to_utc")?,
            is_recovery: row.try_get("is_recovery")?,
            data: row.try_get("data")?,
        })
    }
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            id: MessageId::from_uuid(row.id_message),
            message_type: MessageTypeId::new(row.id_message_type),
            publisher_instance: PublisherInstanceId::from_uuid(row.id_publisher_instance),
            previous_message: row.id_previous_message.map(MessageId::from_uuid),
            created_utc: row.created_utc,
            valid_to_utc: row.valid_to_utc,
            is_recovery: row.is_recovery,
            data: row.data,
        }
    }
}

/// Decode a row selected with `TicketTable::columns`.
fn ticket_from_row(kind: TicketKind, row: &PgRow) -> StoreResult<DeliveryTicket> {
    let decode = |e: sqlx::Error| StoreError::Serialization(format!("failed to read ticket row: {e}"));

    let queue = match kind {
        TicketKind::Subscriber => {
            QueueRef::Subscriber(SubscriberId::from_uuid(row.try_get("id_queue").map_err(decode)?))
        }
        TicketKind::TempQueue => QueueRef::Job(JobId::new(row.try_get("id_queue").map_err(decode)?)),
    };
    let state: i16 = row.try_get("state").map_err(decode)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(decode)?;

    Ok(DeliveryTicket {
        id: TicketId::from_uuid(row.try_get("id_ticket").map_err(decode)?),
        queue,
        message: MessageId::from_uuid(row.try_get("id_message").map_err(decode)?),
        owner_instance: row.try_get("id_owner").map_err(decode)?,
        last_access_utc: row.try_get("last_access_utc").map_err(decode)?,
        state: TicketState::from_code(state)?,
        snapshot: row.try_get("snapshot").map_err(decode)?,
        retry_count: u32::try_from(retry_count).map_err(|_| {
            StoreError::Serialization(format!("negative retry count {retry_count}"))
        })?,
        delayed_to_utc: row.try_get("delayed_to_utc").map_err(decode)?,
        concurrency_token: ConcurrencyToken::from_uuid(
            row.try_get("concurrency_token").map_err(decode)?,
        ),
    })
}

fn state_codes(states: &[TicketState]) -> Vec<i16> {
    states.iter().map(|s| s.code()).collect()
}

impl PostgresBusStore {
    async fn fetch_message(&self, message: MessageId) -> StoreResult<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM bus.message m WHERE m.id_message = $1"
        ))
        .bind(message.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_message", e))?;

        row.map(|row| {
            MessageRow::from_row(&row)
                .map(Message::from)
                .map_err(|e| StoreError::Serialization(format!("failed to read message row: {e}")))
        })
        .transpose()
    }

    async fn tickets_of(&self, kind: TicketKind, message: MessageId) -> StoreResult<Vec<DeliveryTicket>> {
        let table = ticket_table(kind);
        let rows = sqlx::query(&format!(
            "SELECT {} FROM {} t WHERE t.id_message = $1 ORDER BY t.{}",
            table.columns("t"),
            table.table,
            table.id
        ))
        .bind(message.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("tickets_for_message", e))?;

        rows.iter().map(|row| ticket_from_row(kind, row)).collect()
    }
}

#[async_trait]
impl DeliveryStore for PostgresBusStore {
    /// Insert the message and its tickets in one transaction.
    ///
    /// Every insert must affect exactly one row; a duplicate id surfaces as an
    /// integrity violation and rolls the whole publish back.
    #[instrument(
        skip(self, message),
        fields(
            message_id = %message.id,
            message_type_id = %message.message_type,
            target_count = targets.len()
        ),
        err
    )]
    async fn publish(
        &self,
        message: &Message,
        targets: &[QueueRef],
    ) -> StoreResult<PublishReceipt> {
        validate_targets(targets)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO bus.message (
                id_message,
                id_message_type,
                id_publisher_instance,
                id_previous_message,
                created_utc,
                valid_to_utc,
                is_recovery,
                data
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(message.id.as_uuid())
        .bind(message.message_type.get())
        .bind(message.publisher_instance.as_uuid())
        .bind(message.previous_message.map(|m| *m.as_uuid()))
        .bind(message.created_utc)
        .bind(message.valid_to_utc)
        .bind(message.is_recovery)
        .bind(&message.data)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_message", e))?;
        expect_one("insert_message", inserted.rows_affected())?;

        let mut tickets = Vec::with_capacity(targets.len());
        for queue in targets {
            let ticket = DeliveryTicket::ready(*queue, message.id);
            let table = ticket_table(queue.kind());
            let sql = format!(
                r#"
                INSERT INTO {table} ({id}, id_message, {queue_column}, state, retry_count, concurrency_token)
                VALUES ($1, $2, $3, $4, 0, $5)
                "#,
                table = table.table,
                id = table.id,
                queue_column = table.queue,
            );
            let query = sqlx::query(&sql)
                .bind(*ticket.id.as_uuid())
                .bind(*message.id.as_uuid());
            let inserted = bind_queue(query, *queue)
                .bind(TicketState::Ready.code())
                .bind(*ticket.concurrency_token.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        StoreError::Integrity {
                            operation: "insert_ticket",
                            expected: 1,
                            affected: 0,
                        }
                    } else {
                        map_sqlx_error("insert_ticket", e)
                    }
                })?;
            expect_one("insert_ticket", inserted.rows_affected())?;
            tickets.push((*queue, ticket.id));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(PublishReceipt {
            message: message.id,
            tickets,
        })
    }

    /// Read the queue head and apply the claimability rule to it.
    #[instrument(skip(self, eligible), fields(queue = %queue, candidate), err)]
    async fn find_next_fifo(
        &self,
        queue: QueueRef,
        eligible: &[TicketState],
        processing_timeout: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DeliveryTicket>> {
        let table = ticket_table(queue.kind());
        let sql = format!(
            r#"
            SELECT {columns}
            FROM {table} t
            JOIN bus.message m ON m.id_message = t.id_message
            WHERE t.{queue_column} = $1
              AND t.state NOT IN ($2, $3)
              AND (m.valid_to_utc IS NULL OR m.valid_to_utc > $4)
            ORDER BY m.created_utc, t.{id}
            LIMIT 1
            "#,
            columns = table.columns("t"),
            table = table.table,
            queue_column = table.queue,
            id = table.id,
        );
        let row = bind_queue(sqlx::query(&sql), queue)
            .bind(TicketState::Completed.code())
            .bind(TicketState::Suspended.code())
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_next_fifo", e))?;

        let head = row
            .map(|row| ticket_from_row(queue.kind(), &row))
            .transpose()?;
        let candidate = head.filter(|t| t.is_claimable(eligible, processing_timeout, now));

        if let Some(ticket) = &candidate {
            Span::current().record("candidate", tracing::field::display(ticket.id));
        }
        Ok(candidate)
    }

    #[instrument(skip(self, eligible), fields(queue = %queue, candidate), err)]
    async fn find_next_non_fifo(
        &self,
        queue: QueueRef,
        eligible: &[TicketState],
        processing_timeout: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DeliveryTicket>> {
        let table = ticket_table(queue.kind());
        // Same predicate as `DeliveryTicket::is_claimable`.
        let sql = format!(
            r#"
            SELECT {columns}
            FROM {table} t
            JOIN bus.message m ON m.id_message = t.id_message
            WHERE t.{queue_column} = $1
              AND (m.valid_to_utc IS NULL OR m.valid_to_utc > $2)
              AND (
                    (t.state = ANY($3) AND t.state <> $4
                        AND (t.delayed_to_utc IS NULL OR t.delayed_to_utc < $2))
                 OR (t.state = $4
                        AND (t.last_access_utc IS NULL OR t.last_access_utc < $5))
              )
            ORDER BY m.created_utc, t.{id}
            LIMIT 1
            "#,
            columns = table.columns("t"),
            table = table.table,
            queue_column = table.queue,
            id = table.id,
        );
        let row = bind_queue(sqlx::query(&sql), queue)
            .bind(now)
            .bind(state_codes(eligible))
            .bind(TicketState::InProgress.code())
            .bind(reclaim_cutoff(now, processing_timeout))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_next_non_fifo", e))?;

        let candidate = row
            .map(|row| ticket_from_row(queue.kind(), &row))
            .transpose()?;

        if let Some(ticket) = &candidate {
            Span::current().record("candidate", tracing::field::display(ticket.id));
        }
        Ok(candidate)
    }

    /// Single conditional `UPDATE`: succeeds only while the ticket is unowned or still
    /// carries the token observed at selection time.
    #[instrument(
        skip(self, candidate),
        fields(ticket_id = %candidate.id, consumer = %consumer.instance(), outcome),
        err
    )]
    async fn try_claim(
        &self,
        candidate: &DeliveryTicket,
        consumer: Consumer,
        processing_timeout: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<ClaimOutcome> {
        if candidate.queue != consumer.queue() {
            return Err(StoreError::Validation(format!(
                "ticket {} belongs to {}, not to {}",
                candidate.id,
                candidate.queue,
                consumer.queue()
            )));
        }

        let span = Span::current();
        let table = ticket_table(candidate.kind());
        let sql = format!(
            r#"
            UPDATE {table} t
            SET {owner} = $2,
                state = $3,
                last_access_utc = $4,
                delayed_to_utc = NULL,
                concurrency_token = $5
            WHERE t.{id} = $1
              AND (t.{owner} IS NULL OR t.concurrency_token = $6)
              AND t.state NOT IN ($7, $8)
              AND (t.state <> $3 OR t.last_access_utc IS NULL OR t.last_access_utc < $9)
            RETURNING {columns}
            "#,
            table = table.table,
            owner = table.owner,
            id = table.id,
            columns = table.columns("t"),
        );
        let rows = sqlx::query(&sql)
            .bind(candidate.id.as_uuid())
            .bind(consumer.instance_uuid())
            .bind(TicketState::InProgress.code())
            .bind(now)
            .bind(*ConcurrencyToken::issue().as_uuid())
            .bind(candidate.concurrency_token.as_uuid())
            .bind(TicketState::Completed.code())
            .bind(TicketState::Suspended.code())
            .bind(reclaim_cutoff(now, processing_timeout))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_ticket", e))?;

        let ticket = match rows.as_slice() {
            [] => {
                span.record("outcome", "lost");
                return Ok(ClaimOutcome::Lost {
                    ticket: candidate.id,
                });
            }
            [row] => ticket_from_row(candidate.kind(), row)?,
            _ => {
                return Err(StoreError::Integrity {
                    operation: "claim_ticket",
                    expected: 1,
                    affected: rows.len() as u64,
                });
            }
        };

        let message = self
            .fetch_message(ticket.message)
            .await?
            .ok_or_else(|| StoreError::not_found("message", ticket.message))?;

        span.record("outcome", "claimed");
        Ok(ClaimOutcome::Claimed(Box::new(ClaimedDelivery { ticket, message })))
    }

    /// Conditional result write keyed by ticket, token and owner.
    #[instrument(
        skip(self, update),
        fields(ticket_id = %ticket, state = ?update.state, outcome),
        err
    )]
    async fn commit(
        &self,
        consumer: Consumer,
        ticket: TicketId,
        token: ConcurrencyToken,
        update: &TicketUpdate,
        now: DateTime<Utc>,
    ) -> StoreResult<CommitOutcome> {
        TicketState::InProgress.ensure_transition(update.state)?;

        let span = Span::current();
        let table = ticket_table(consumer.queue().kind());
        let next_token = ConcurrencyToken::issue();
        let sql = format!(
            r#"
            UPDATE {table}
            SET state = $4,
                retry_count = $5,
                delayed_to_utc = $6,
                snapshot = COALESCE($7, snapshot),
                last_access_utc = $8,
                concurrency_token = $9
            WHERE {id} = $1
              AND concurrency_token = $2
              AND {owner} = $3
              AND {queue_column} = $10
            "#,
            table = table.table,
            id = table.id,
            owner = table.owner,
            queue_column = table.queue,
        );
        let query = sqlx::query(&sql)
            .bind(*ticket.as_uuid())
            .bind(*token.as_uuid())
            .bind(consumer.instance_uuid())
            .bind(update.state.code())
            .bind(retry_count_column(update.retry_count))
            .bind(update.delayed_to_utc)
            .bind(update.snapshot.clone())
            .bind(now)
            .bind(*next_token.as_uuid());
        let result = bind_queue(query, consumer.queue())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("commit_ticket", e))?;

        match result.rows_affected() {
            0 => {
                span.record("outcome", "lost");
                Ok(CommitOutcome::Lost)
            }
            1 => {
                span.record("outcome", "committed");
                Ok(CommitOutcome::Committed { token: next_token })
            }
            affected => Err(StoreError::Integrity {
                operation: "commit_ticket",
                expected: 1,
                affected,
            }),
        }
    }

    #[instrument(skip(self), fields(ticket_id = %ticket, outcome), err)]
    async fn heartbeat(
        &self,
        consumer: Consumer,
        ticket: TicketId,
        token: ConcurrencyToken,
        now: DateTime<Utc>,
    ) -> StoreResult<CommitOutcome> {
        let table = ticket_table(consumer.queue().kind());
        let sql = format!(
            r#"
            UPDATE {table}
            SET last_access_utc = $4
            WHERE {id} = $1
              AND concurrency_token = $2
              AND {owner} = $3
              AND state = $5
            "#,
            table = table.table,
            id = table.id,
            owner = table.owner,
        );
        let result = sqlx::query(&sql)
            .bind(ticket.as_uuid())
            .bind(token.as_uuid())
            .bind(consumer.instance_uuid())
            .bind(now)
            .bind(TicketState::InProgress.code())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("heartbeat", e))?;

        let outcome = match result.rows_affected() {
            0 => CommitOutcome::Lost,
            1 => CommitOutcome::Committed { token },
            affected => {
                return Err(StoreError::Integrity {
                    operation: "heartbeat",
                    expected: 1,
                    affected,
                });
            }
        };
        Span::current().record("outcome", if outcome.is_committed() { "alive" } else { "lost" });
        Ok(outcome)
    }

    #[instrument(skip(self), fields(ticket_id = %ticket), err)]
    async fn load_ticket(
        &self,
        kind: TicketKind,
        ticket: TicketId,
    ) -> StoreResult<Option<DeliveryTicket>> {
        let table = ticket_table(kind);
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} t WHERE t.{} = $1",
            table.columns("t"),
            table.table,
            table.id
        ))
        .bind(ticket.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_ticket", e))?;

        row.map(|row| ticket_from_row(kind, &row)).transpose()
    }

    #[instrument(skip(self), fields(message_id = %message), err)]
    async fn load_message(&self, message: MessageId) -> StoreResult<Option<Message>> {
        self.fetch_message(message).await
    }

    #[instrument(skip(self), fields(message_id = %message), err)]
    async fn tickets_for_message(&self, message: MessageId) -> StoreResult<Vec<DeliveryTicket>> {
        let mut tickets = self.tickets_of(TicketKind::Subscriber, message).await?;
        tickets.extend(self.tickets_of(TicketKind::TempQueue, message).await?);
        Ok(tickets)
    }

    #[instrument(skip(self), fields(queue = %queue), err)]
    async fn count_by_state(&self, queue: QueueRef) -> StoreResult<QueueDepth> {
        let table = ticket_table(queue.kind());
        let sql = format!(
            "SELECT state, COUNT(*) AS tickets FROM {} WHERE {} = $1 GROUP BY state",
            table.table, table.queue
        );
        let rows = bind_queue(sqlx::query(&sql), queue)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_by_state", e))?;

        let mut depth = QueueDepth::new();
        for row in rows {
            let state: i16 = row.try_get("state").map_err(|e| map_sqlx_error("count_by_state", e))?;
            let count: i64 = row
                .try_get("tickets")
                .map_err(|e| map_sqlx_error("count_by_state", e))?;
            depth.insert(TicketState::from_code(state)?, count.max(0) as u64);
        }
        Ok(depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eligible_states_bind_as_codes() {
        assert_eq!(state_codes(&TicketState::DEFAULT_ELIGIBLE), vec![1, 4, 5]);
    }
}
