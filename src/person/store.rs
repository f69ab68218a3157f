use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::StoreError;
use crate::formats::serialize_ch_datetime;
use crate::metrics_consts::{DB_QUERY_DURATION, PERSONS_CREATED};
use crate::producer::{LogMessage, MessageProducer};
use crate::types::{Person, Properties, TeamId};

/// Fields of a person row that `update` may change. `None` leaves the column
/// untouched.
#[derive(Clone, Debug, Default)]
pub struct PersonPatch {
    pub properties: Option<Properties>,
    pub created_at: Option<DateTime<Utc>>,
    pub is_identified: Option<bool>,
}

/// Relational CRUD on persons and distinct ids. The identity resolver is the
/// sole writer; everything else reads.
#[async_trait]
pub trait PersonRepository: Send + Sync {
    async fn fetch_person(
        &self,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<Option<Person>, StoreError>;

    async fn distinct_id_exists(
        &self,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<bool, StoreError>;

    /// Insert the person row and one row per distinct id, in one transaction.
    /// A taken distinct id surfaces as `RaceCondition`.
    #[allow(clippy::too_many_arguments)]
    async fn create_person(
        &self,
        created_at: DateTime<Utc>,
        properties: Properties,
        team_id: TeamId,
        is_user_id: Option<i32>,
        is_identified: bool,
        uuid: Uuid,
        distinct_ids: &[String],
    ) -> Result<Person, StoreError>;

    async fn update_person(
        &self,
        person: &Person,
        patch: PersonPatch,
    ) -> Result<Person, StoreError>;

    /// Transactional delete of the person's cohort memberships, distinct-id
    /// rows, then the person row. A distinct id committed by a peer between
    /// the sweep and the person delete fails the whole transaction with
    /// `ForeignKeyViolation`.
    async fn delete_person(&self, person: &Person) -> Result<(), StoreError>;

    async fn add_distinct_id(&self, person: &Person, distinct_id: &str)
        -> Result<(), StoreError>;

    /// Repoint every distinct id on `from` to `to`, returning the moved ids.
    /// `RaceCondition` means `to` no longer exists (lost to a peer merge) and
    /// the caller must re-observe state.
    async fn move_distinct_ids(
        &self,
        from: &Person,
        to: &Person,
    ) -> Result<Vec<String>, StoreError>;

    /// Atomic per-key numeric increments on the properties column. Returns
    /// the resulting properties, or `None` when the person row is gone.
    async fn apply_increments(
        &self,
        person: &Person,
        increments: &[(String, i64)],
    ) -> Result<Option<Properties>, StoreError>;

    async fn reassign_cohorts(&self, from: &Person, to: &Person) -> Result<(), StoreError>;
}

/// Columnar-store collaborator, used only for tombstone DDL on person
/// deletion.
#[async_trait]
pub trait ColumnarClient: Send + Sync {
    async fn execute(&self, query: &str) -> Result<(), StoreError>;
}

// ============================================================
// Postgres implementation
// ============================================================

pub struct PostgresPersonRepository {
    pool: PgPool,
}

impl PostgresPersonRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, Clone, FromRow)]
struct PersonRow {
    id: i64,
    uuid: Uuid,
    team_id: TeamId,
    properties: serde_json::Value,
    created_at: DateTime<Utc>,
    is_identified: bool,
    is_user_id: Option<i32>,
}

impl From<PersonRow> for Person {
    fn from(row: PersonRow) -> Self {
        Person {
            id: row.id,
            uuid: row.uuid,
            team_id: row.team_id,
            properties: row.properties.as_object().cloned().unwrap_or_default(),
            created_at: row.created_at,
            is_identified: row.is_identified,
            is_user_id: row.is_user_id,
        }
    }
}

#[async_trait]
impl PersonRepository for PostgresPersonRepository {
    async fn fetch_person(
        &self,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<Option<Person>, StoreError> {
        let labels = [("operation".to_string(), "fetch_person".to_string())];
        let _timer = crate::metrics_utils::timing_guard(DB_QUERY_DURATION, &labels);

        let row = sqlx::query_as::<_, PersonRow>(
            r#"
            SELECT p.id, p.uuid, p.team_id, p.properties, p.created_at,
                   p.is_identified, p.is_user_id
            FROM posthog_person p
            INNER JOIN posthog_persondistinctid d
                ON p.id = d.person_id AND p.team_id = d.team_id
            WHERE p.team_id = $1 AND d.distinct_id = $2
            LIMIT 1
            "#,
        )
        .bind(team_id)
        .bind(distinct_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Person::from))
    }

    async fn distinct_id_exists(
        &self,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<bool, StoreError> {
        let labels = [("operation".to_string(), "distinct_id_exists".to_string())];
        let _timer = crate::metrics_utils::timing_guard(DB_QUERY_DURATION, &labels);

        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT count(*) FROM posthog_persondistinctid
            WHERE team_id = $1 AND distinct_id = $2
            "#,
        )
        .bind(team_id)
        .bind(distinct_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    async fn create_person(
        &self,
        created_at: DateTime<Utc>,
        properties: Properties,
        team_id: TeamId,
        is_user_id: Option<i32>,
        is_identified: bool,
        uuid: Uuid,
        distinct_ids: &[String],
    ) -> Result<Person, StoreError> {
        let labels = [("operation".to_string(), "create_person".to_string())];
        let _timer = crate::metrics_utils::timing_guard(DB_QUERY_DURATION, &labels);

        let mut tx = self.pool.begin().await?;

        let person_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO posthog_person
                (uuid, created_at, team_id, properties, is_identified, is_user_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(uuid)
        .bind(created_at)
        .bind(team_id)
        .bind(Json(&properties))
        .bind(is_identified)
        .bind(is_user_id)
        .fetch_one(&mut *tx)
        .await?;

        for distinct_id in distinct_ids {
            sqlx::query(
                r#"
                INSERT INTO posthog_persondistinctid (distinct_id, person_id, team_id)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(distinct_id)
            .bind(person_id)
            .bind(team_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        metrics::counter!(PERSONS_CREATED).increment(1);

        Ok(Person {
            id: person_id,
            uuid,
            team_id,
            properties,
            created_at,
            is_identified,
            is_user_id,
        })
    }

    async fn update_person(
        &self,
        person: &Person,
        patch: PersonPatch,
    ) -> Result<Person, StoreError> {
        let labels = [("operation".to_string(), "update_person".to_string())];
        let _timer = crate::metrics_utils::timing_guard(DB_QUERY_DURATION, &labels);

        let row = sqlx::query_as::<_, PersonRow>(
            r#"
            UPDATE posthog_person
            SET properties = COALESCE($3, properties),
                created_at = COALESCE($4, created_at),
                is_identified = COALESCE($5, is_identified)
            WHERE team_id = $1 AND id = $2
            RETURNING id, uuid, team_id, properties, created_at, is_identified, is_user_id
            "#,
        )
        .bind(person.team_id)
        .bind(person.id)
        .bind(patch.properties.as_ref().map(Json))
        .bind(patch.created_at)
        .bind(patch.is_identified)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Person::from).ok_or(StoreError::NotFound)
    }

    async fn delete_person(&self, person: &Person) -> Result<(), StoreError> {
        let labels = [("operation".to_string(), "delete_person".to_string())];
        let _timer = crate::metrics_utils::timing_guard(DB_QUERY_DURATION, &labels);

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM posthog_cohortpeople WHERE person_id = $1")
            .bind(person.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM posthog_persondistinctid WHERE team_id = $1 AND person_id = $2")
            .bind(person.team_id)
            .bind(person.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM posthog_person WHERE team_id = $1 AND id = $2")
            .bind(person.team_id)
            .bind(person.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn add_distinct_id(
        &self,
        person: &Person,
        distinct_id: &str,
    ) -> Result<(), StoreError> {
        let labels = [("operation".to_string(), "add_distinct_id".to_string())];
        let _timer = crate::metrics_utils::timing_guard(DB_QUERY_DURATION, &labels);

        sqlx::query(
            r#"
            INSERT INTO posthog_persondistinctid (distinct_id, person_id, team_id)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(distinct_id)
        .bind(person.id)
        .bind(person.team_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn move_distinct_ids(
        &self,
        from: &Person,
        to: &Person,
    ) -> Result<Vec<String>, StoreError> {
        let labels = [("operation".to_string(), "move_distinct_ids".to_string())];
        let _timer = crate::metrics_utils::timing_guard(DB_QUERY_DURATION, &labels);

        let result = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE posthog_persondistinctid
            SET person_id = $3
            WHERE team_id = $1 AND person_id = $2
            RETURNING distinct_id
            "#,
        )
        .bind(from.team_id)
        .bind(from.id)
        .bind(to.id)
        .fetch_all(&self.pool)
        .await;

        match result {
            Ok(moved) => Ok(moved),
            // The target person vanished under us (lost a concurrent merge).
            Err(e) => match StoreError::from(e) {
                StoreError::ForeignKeyViolation(msg) => Err(StoreError::RaceCondition(format!(
                    "target person no longer exists: {msg}"
                ))),
                other => Err(other),
            },
        }
    }

    async fn apply_increments(
        &self,
        person: &Person,
        increments: &[(String, i64)],
    ) -> Result<Option<Properties>, StoreError> {
        let labels = [("operation".to_string(), "apply_increments".to_string())];
        let _timer = crate::metrics_utils::timing_guard(DB_QUERY_DURATION, &labels);

        let mut latest: Option<Properties> = None;
        for (key, amount) in increments {
            let row: Option<serde_json::Value> = sqlx::query_scalar(
                r#"
                UPDATE posthog_person
                SET properties = jsonb_set(
                    properties,
                    ARRAY[$3],
                    to_jsonb(CASE WHEN jsonb_typeof(properties -> $3) = 'number'
                                  THEN (properties ->> $3)::numeric + $4
                                  ELSE $4::numeric END),
                    true)
                WHERE team_id = $1 AND id = $2
                RETURNING properties
                "#,
            )
            .bind(person.team_id)
            .bind(person.id)
            .bind(key)
            .bind(amount)
            .fetch_optional(&self.pool)
            .await?;

            latest = row.and_then(|v| v.as_object().cloned());
        }

        Ok(latest)
    }

    async fn reassign_cohorts(&self, from: &Person, to: &Person) -> Result<(), StoreError> {
        let labels = [("operation".to_string(), "reassign_cohorts".to_string())];
        let _timer = crate::metrics_utils::timing_guard(DB_QUERY_DURATION, &labels);

        let mut tx = self.pool.begin().await?;

        // Move memberships the target does not already have, drop the rest.
        sqlx::query(
            r#"
            UPDATE posthog_cohortpeople c
            SET person_id = $2
            WHERE person_id = $1
              AND NOT EXISTS (
                SELECT 1 FROM posthog_cohortpeople
                WHERE person_id = $2 AND cohort_id = c.cohort_id
              )
            "#,
        )
        .bind(from.id)
        .bind(to.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM posthog_cohortpeople WHERE person_id = $1")
            .bind(from.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

// ============================================================
// Mirroring wrapper
// ============================================================

#[derive(Debug, Serialize)]
struct PersonMessage {
    id: Uuid,
    #[serde(serialize_with = "serialize_ch_datetime")]
    created_at: DateTime<Utc>,
    team_id: TeamId,
    properties: String,
    is_identified: bool,
    is_deleted: u8,
}

impl PersonMessage {
    fn from_person(person: &Person, is_deleted: bool) -> Self {
        Self {
            id: person.uuid,
            created_at: person.created_at,
            team_id: person.team_id,
            properties: serde_json::Value::Object(person.properties.clone()).to_string(),
            is_identified: person.is_identified,
            is_deleted: is_deleted as u8,
        }
    }
}

#[derive(Debug, Serialize)]
struct PersonDistinctIdMessage {
    id: Uuid,
    distinct_id: String,
    person_id: Uuid,
    team_id: TeamId,
    is_deleted: u8,
}

/// The Person Store: repository access plus the dual-sink publication rule.
/// Every mutation queues its mirror messages strictly after the relational
/// commit, so the log is always a subset of committed state.
pub struct PersonStore {
    repository: Arc<dyn PersonRepository>,
    producer: Option<Arc<dyn MessageProducer>>,
    columnar: Option<Arc<dyn ColumnarClient>>,
    person_topic: String,
    distinct_id_topic: String,
}

impl PersonStore {
    pub fn new(
        repository: Arc<dyn PersonRepository>,
        producer: Option<Arc<dyn MessageProducer>>,
        columnar: Option<Arc<dyn ColumnarClient>>,
        person_topic: String,
        distinct_id_topic: String,
    ) -> Self {
        Self {
            repository,
            producer,
            columnar,
            person_topic,
            distinct_id_topic,
        }
    }

    pub fn has_log_producer(&self) -> bool {
        self.producer.is_some()
    }

    pub(crate) fn log_producer(&self) -> Option<&Arc<dyn MessageProducer>> {
        self.producer.as_ref()
    }

    pub async fn fetch(
        &self,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<Option<Person>, StoreError> {
        self.repository.fetch_person(team_id, distinct_id).await
    }

    pub async fn distinct_id_exists(
        &self,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<bool, StoreError> {
        self.repository
            .distinct_id_exists(team_id, distinct_id)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        created_at: DateTime<Utc>,
        properties: Properties,
        team_id: TeamId,
        is_user_id: Option<i32>,
        is_identified: bool,
        uuid: Uuid,
        distinct_ids: &[String],
    ) -> Result<Person, StoreError> {
        let person = self
            .repository
            .create_person(
                created_at,
                properties,
                team_id,
                is_user_id,
                is_identified,
                uuid,
                distinct_ids,
            )
            .await?;

        self.publish_person(&person, false).await?;
        for distinct_id in distinct_ids {
            self.publish_distinct_id(&person, distinct_id, false).await?;
        }
        Ok(person)
    }

    pub async fn update(&self, person: &Person, patch: PersonPatch) -> Result<Person, StoreError> {
        let updated = self.repository.update_person(person, patch).await?;
        self.publish_person(&updated, false).await?;
        Ok(updated)
    }

    pub async fn delete(&self, person: &Person) -> Result<(), StoreError> {
        self.repository.delete_person(person).await?;

        if let Some(columnar) = &self.columnar {
            columnar
                .execute(&format!(
                    "ALTER TABLE person DELETE WHERE id = '{}'",
                    person.uuid
                ))
                .await?;
            columnar
                .execute(&format!(
                    "ALTER TABLE person_distinct_id DELETE WHERE person_id = '{}'",
                    person.uuid
                ))
                .await?;
        }

        self.publish_person(person, true).await?;
        Ok(())
    }

    pub async fn add_distinct_id(
        &self,
        person: &Person,
        distinct_id: &str,
    ) -> Result<(), StoreError> {
        self.repository.add_distinct_id(person, distinct_id).await?;
        self.publish_distinct_id(person, distinct_id, false).await?;
        Ok(())
    }

    pub async fn move_distinct_ids(
        &self,
        from: &Person,
        to: &Person,
    ) -> Result<Vec<String>, StoreError> {
        let moved = self.repository.move_distinct_ids(from, to).await?;
        for distinct_id in &moved {
            self.publish_distinct_id(to, distinct_id, false).await?;
        }
        Ok(moved)
    }

    pub async fn apply_increments(
        &self,
        person: &Person,
        increments: &[(String, i64)],
    ) -> Result<Option<Properties>, StoreError> {
        self.repository.apply_increments(person, increments).await
    }

    pub async fn reassign_cohorts(&self, from: &Person, to: &Person) -> Result<(), StoreError> {
        self.repository.reassign_cohorts(from, to).await
    }

    async fn publish_person(&self, person: &Person, is_deleted: bool) -> Result<(), StoreError> {
        let Some(producer) = &self.producer else {
            return Ok(());
        };
        let message = PersonMessage::from_person(person, is_deleted);
        let payload = serde_json::to_vec(&message)
            .map_err(|e| StoreError::Database(format!("person message serialization: {e}")))?;
        producer
            .queue(
                &self.person_topic,
                vec![LogMessage::new(Some(person.uuid.to_string()), payload)],
            )
            .await?;
        Ok(())
    }

    async fn publish_distinct_id(
        &self,
        person: &Person,
        distinct_id: &str,
        is_deleted: bool,
    ) -> Result<(), StoreError> {
        let Some(producer) = &self.producer else {
            return Ok(());
        };
        let message_id = Uuid::now_v7();
        let message = PersonDistinctIdMessage {
            id: message_id,
            distinct_id: distinct_id.to_string(),
            person_id: person.uuid,
            team_id: person.team_id,
            is_deleted: is_deleted as u8,
        };
        let payload = serde_json::to_vec(&message)
            .map_err(|e| StoreError::Database(format!("distinct id message serialization: {e}")))?;
        producer
            .queue(
                &self.distinct_id_topic,
                vec![LogMessage::new(Some(message_id.to_string()), payload)],
            )
            .await?;
        Ok(())
    }
}
