use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::types::Json;

use crate::elements::{hash_elements, Element};
use crate::error::SinkError;
use crate::metrics_consts::{DB_QUERY_DURATION, EVENTS_EMITTED, SNAPSHOTS_EMITTED};
use crate::sink::EventSink;
use crate::types::{CanonicalEvent, SessionRecordingEvent};

/// The row sink: events land in `posthog_event`, with elements content-
/// addressed into immutable element groups.
pub struct PostgresEventSink {
    pool: PgPool,
}

impl PostgresEventSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Find or create the element group for this ordered element list.
    /// Creation races are expected; the loser refetches the winner's group.
    async fn ensure_element_group(
        &self,
        team_id: i32,
        elements: &[Element],
    ) -> Result<Option<String>, SinkError> {
        if elements.is_empty() {
            return Ok(None);
        }
        let hash = hash_elements(elements);

        let existing: Option<i32> = sqlx::query_scalar(
            "SELECT id FROM posthog_elementgroup WHERE team_id = $1 AND hash = $2",
        )
        .bind(team_id)
        .bind(&hash)
        .fetch_optional(&self.pool)
        .await?;
        if existing.is_some() {
            return Ok(Some(hash));
        }

        let inserted = self.insert_element_group(team_id, &hash, elements).await;
        match inserted {
            Ok(()) => Ok(Some(hash)),
            Err(e) => {
                // 23505: a peer inserted the same group first, which is fine,
                // groups are immutable and content-addressed.
                if let Some(db_err) = db_error_code(&e) {
                    if db_err == "23505" {
                        return Ok(Some(hash));
                    }
                }
                Err(e.into())
            }
        }
    }

    async fn insert_element_group(
        &self,
        team_id: i32,
        hash: &str,
        elements: &[Element],
    ) -> Result<(), sqlx::Error> {
        let labels = [("operation".to_string(), "insert_element_group".to_string())];
        let _timer = crate::metrics_utils::timing_guard(DB_QUERY_DURATION, &labels);

        let mut tx = self.pool.begin().await?;

        let group_id: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO posthog_elementgroup (hash, team_id)
            VALUES ($1, $2)
            RETURNING id
            "#,
        )
        .bind(hash)
        .bind(team_id)
        .fetch_one(&mut *tx)
        .await?;

        for element in elements {
            sqlx::query(
                r#"
                INSERT INTO posthog_element
                    (text, tag_name, href, attr_id, attr_class, nth_child, nth_of_type,
                     attributes, "order", group_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(&element.text)
            .bind(&element.tag_name)
            .bind(&element.href)
            .bind(&element.attr_id)
            .bind(&element.attr_class)
            .bind(element.nth_child)
            .bind(element.nth_of_type)
            .bind(Json(&element.attributes))
            .bind(element.order)
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

fn db_error_code(err: &sqlx::Error) -> Option<String> {
    err.as_database_error()
        .and_then(|e| e.code().map(|c| c.to_string()))
}

#[async_trait]
impl EventSink for PostgresEventSink {
    async fn emit_event(
        &self,
        event: &CanonicalEvent,
        elements: &[Element],
    ) -> Result<Option<i64>, SinkError> {
        let elements_hash = self.ensure_element_group(event.team_id, elements).await?;

        let properties: serde_json::Value = serde_json::from_str(&event.properties)?;

        let labels = [("operation".to_string(), "insert_event".to_string())];
        let _timer = crate::metrics_utils::timing_guard(DB_QUERY_DURATION, &labels);

        let row_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO posthog_event
                (created_at, team_id, event, distinct_id, properties, timestamp, elements_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(event.created_at)
        .bind(event.team_id)
        .bind(&event.event)
        .bind(&event.distinct_id)
        .bind(Json(&properties))
        .bind(event.timestamp)
        .bind(elements_hash)
        .fetch_one(&self.pool)
        .await?;

        metrics::counter!(EVENTS_EMITTED, "sink" => "rows").increment(1);
        Ok(Some(row_id))
    }

    async fn emit_snapshot(&self, snapshot: &SessionRecordingEvent) -> Result<(), SinkError> {
        let snapshot_data: serde_json::Value = serde_json::from_str(&snapshot.snapshot_data)?;

        let labels = [(
            "operation".to_string(),
            "insert_session_recording_event".to_string(),
        )];
        let _timer = crate::metrics_utils::timing_guard(DB_QUERY_DURATION, &labels);

        sqlx::query(
            r#"
            INSERT INTO posthog_sessionrecordingevent
                (uuid, created_at, timestamp, team_id, distinct_id, session_id, snapshot_data)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(snapshot.uuid)
        .bind(snapshot.created_at)
        .bind(snapshot.timestamp)
        .bind(snapshot.team_id)
        .bind(&snapshot.distinct_id)
        .bind(&snapshot.session_id)
        .bind(Json(&snapshot_data))
        .execute(&self.pool)
        .await?;

        metrics::counter!(SNAPSHOTS_EMITTED, "sink" => "rows").increment(1);
        Ok(())
    }
}
