//! Tracks which events and properties each team has sent, by upserting
//! definition rows as events flow through. Definitions are advisory metadata;
//! failures here never fail the event.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use moka::sync::Cache;
use serde_json::Value;
use sqlx::postgres::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::error::StoreError;
use crate::metrics_consts::{DB_QUERY_DURATION, DEFINITIONS_UPSERTED};
use crate::team_manager::TeamManager;
use crate::types::{Properties, Team, TeamId};

/// Events that never get definition rows.
pub const EVENTS_WITHOUT_DEFINITIONS: [&str; 1] = ["$$plugin_metrics"];

/// Properties that are routing/metadata rather than user data.
pub const SKIP_PROPERTIES: [&str; 9] = [
    "$set",
    "$set_once",
    "$unset",
    "$group_0",
    "$group_1",
    "$group_2",
    "$group_3",
    "$group_4",
    "$groups",
];

/// Organizations with this feature get property types recorded alongside the
/// bare definitions.
const TAXONOMY_FEATURE: &str = "ingestion_taxonomy";

/// An event with more properties than this is assumed to be malformed and is
/// skipped entirely.
const PROPERTY_SKIP_THRESHOLD: usize = 10_000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PropertyParentType {
    Event = 1,
    Person = 2,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PropertyValueType {
    DateTime,
    String,
    Numeric,
    Boolean,
}

impl PropertyValueType {
    fn as_str(&self) -> &'static str {
        match self {
            PropertyValueType::DateTime => "DateTime",
            PropertyValueType::String => "String",
            PropertyValueType::Numeric => "Numeric",
            PropertyValueType::Boolean => "Boolean",
        }
    }
}

#[derive(Clone, Debug)]
pub struct PropertyDefinitionUpsert {
    pub id: Uuid,
    pub team_id: TeamId,
    pub project_id: i64,
    pub name: String,
    pub parent_type: PropertyParentType,
    pub is_numerical: bool,
    pub property_type: Option<PropertyValueType>,
}

#[async_trait]
pub trait DefinitionsRepository: Send + Sync {
    async fn upsert_event_definition(
        &self,
        team_id: TeamId,
        project_id: i64,
        name: &str,
        last_seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn upsert_property_definition(
        &self,
        def: &PropertyDefinitionUpsert,
    ) -> Result<(), StoreError>;

    async fn upsert_event_property(
        &self,
        team_id: TeamId,
        project_id: i64,
        event: &str,
        property: &str,
    ) -> Result<(), StoreError>;
}

pub struct PostgresDefinitionsRepository {
    pool: PgPool,
}

impl PostgresDefinitionsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DefinitionsRepository for PostgresDefinitionsRepository {
    async fn upsert_event_definition(
        &self,
        team_id: TeamId,
        project_id: i64,
        name: &str,
        last_seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let labels = [(
            "operation".to_string(),
            "upsert_event_definition".to_string(),
        )];
        let _timer = crate::metrics_utils::timing_guard(DB_QUERY_DURATION, &labels);

        sqlx::query(
            r#"
            INSERT INTO posthog_eventdefinition (id, name, team_id, project_id, last_seen_at, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (coalesce(project_id, team_id::bigint), name)
            DO UPDATE SET last_seen_at = EXCLUDED.last_seen_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(name)
        .bind(team_id)
        .bind(project_id)
        .bind(last_seen_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_property_definition(
        &self,
        def: &PropertyDefinitionUpsert,
    ) -> Result<(), StoreError> {
        let labels = [(
            "operation".to_string(),
            "upsert_property_definition".to_string(),
        )];
        let _timer = crate::metrics_utils::timing_guard(DB_QUERY_DURATION, &labels);

        sqlx::query(
            r#"
            INSERT INTO posthog_propertydefinition
                (id, name, type, group_type_index, is_numerical, team_id, project_id, property_type)
            VALUES ($1, $2, $3, NULL, $4, $5, $6, $7)
            ON CONFLICT (coalesce(project_id, team_id::bigint), name, type, coalesce(group_type_index, -1))
            DO UPDATE SET property_type = COALESCE(posthog_propertydefinition.property_type, EXCLUDED.property_type)
            "#,
        )
        .bind(def.id)
        .bind(&def.name)
        .bind(def.parent_type as i32)
        .bind(def.is_numerical)
        .bind(def.team_id)
        .bind(def.project_id)
        .bind(def.property_type.map(|t| t.as_str()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_event_property(
        &self,
        team_id: TeamId,
        project_id: i64,
        event: &str,
        property: &str,
    ) -> Result<(), StoreError> {
        let labels = [("operation".to_string(), "upsert_event_property".to_string())];
        let _timer = crate::metrics_utils::timing_guard(DB_QUERY_DURATION, &labels);

        sqlx::query(
            r#"
            INSERT INTO posthog_eventproperty (event, property, team_id, project_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(event)
        .bind(property)
        .bind(team_id)
        .bind(project_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Dedupes definition writes across the event stream with a TTL-bounded seen
/// cache, and gates rich property typing on the organization's features.
pub struct DefinitionsManager {
    repository: Arc<dyn DefinitionsRepository>,
    team_manager: Arc<TeamManager>,
    seen: Cache<String, ()>,
}

impl DefinitionsManager {
    pub fn new(
        repository: Arc<dyn DefinitionsRepository>,
        team_manager: Arc<TeamManager>,
        config: &Config,
    ) -> Self {
        let seen = Cache::builder()
            .max_capacity(config.definitions_cache_capacity)
            .time_to_live(Duration::from_secs(config.definitions_cache_ttl_secs))
            .build();
        Self {
            repository,
            team_manager,
            seen,
        }
    }

    pub async fn register_event(
        &self,
        team: &Team,
        event_name: &str,
        properties: &Properties,
    ) -> Result<(), StoreError> {
        if EVENTS_WITHOUT_DEFINITIONS.contains(&event_name) {
            return Ok(());
        }
        if properties.len() > PROPERTY_SKIP_THRESHOLD {
            warn!(
                team_id = team.id,
                event = %event_name,
                "event has too many properties, skipping definitions"
            );
            return Ok(());
        }

        let track_types = match self.team_manager.get_organization(team.organization_id).await {
            Ok(Some(org)) => org.has_feature(TAXONOMY_FEATURE),
            Ok(None) => false,
            Err(e) => {
                warn!(team_id = team.id, "organization lookup failed: {e}");
                false
            }
        };

        // last_seen_at is floored to the day so repeat upserts within a day
        // dedupe in the cache.
        let last_seen_at = floor_to_day(Utc::now());
        let event_key = format!("evt:{}:{}:{}", team.id, event_name, last_seen_at.timestamp());
        if self.seen.get(&event_key).is_none() {
            self.repository
                .upsert_event_definition(team.id, team.project_id(), event_name, last_seen_at)
                .await?;
            metrics::counter!(DEFINITIONS_UPSERTED, "kind" => "event").increment(1);
            self.seen.insert(event_key, ());
        }

        self.register_properties(
            team,
            event_name,
            properties,
            PropertyParentType::Event,
            track_types,
        )
        .await?;

        // Person properties travel inside $set / $set_once.
        for key in ["$set", "$set_once"] {
            if let Some(Value::Object(props)) = properties.get(key) {
                self.register_properties(
                    team,
                    event_name,
                    props,
                    PropertyParentType::Person,
                    track_types,
                )
                .await?;
            }
        }

        Ok(())
    }

    async fn register_properties(
        &self,
        team: &Team,
        event_name: &str,
        properties: &Properties,
        parent_type: PropertyParentType,
        track_types: bool,
    ) -> Result<(), StoreError> {
        for (name, value) in properties {
            if parent_type == PropertyParentType::Event && SKIP_PROPERTIES.contains(&name.as_str())
            {
                continue;
            }

            if parent_type == PropertyParentType::Event {
                let ep_key = format!("ep:{}:{}:{}", team.id, event_name, name);
                if self.seen.get(&ep_key).is_none() {
                    self.repository
                        .upsert_event_property(team.id, team.project_id(), event_name, name)
                        .await?;
                    self.seen.insert(ep_key, ());
                }
            }

            let property_type = if track_types {
                detect_property_type(name, value)
            } else {
                None
            };
            let is_numerical = matches!(property_type, Some(PropertyValueType::Numeric))
                || matches!(value, Value::Number(_));

            let def_key = format!("prop:{}:{}:{}", team.id, parent_type as i32, name);
            if self.seen.get(&def_key).is_none() {
                self.repository
                    .upsert_property_definition(&PropertyDefinitionUpsert {
                        id: Uuid::now_v7(),
                        team_id: team.id,
                        project_id: team.project_id(),
                        name: name.clone(),
                        parent_type,
                        is_numerical,
                        property_type,
                    })
                    .await?;
                metrics::counter!(DEFINITIONS_UPSERTED, "kind" => "property").increment(1);
                self.seen.insert(def_key, ());
            }
        }
        Ok(())
    }
}

fn detect_property_type(key: &str, value: &Value) -> Option<PropertyValueType> {
    // utm_ values sometimes look numeric on the first sighting even though
    // later values are not; always treat them as strings. Same for feature
    // flag values, which flip between booleans and strings.
    if key.starts_with("utm_") || key.starts_with("$feature/") || key == "$feature_flag_response" {
        return Some(PropertyValueType::String);
    }

    match value {
        Value::String(s) => {
            let s = s.trim().to_lowercase();
            if s == "true" || s == "false" {
                Some(PropertyValueType::Boolean)
            } else {
                Some(PropertyValueType::String)
            }
        }
        Value::Number(_) => {
            if key.to_lowercase().contains("timestamp") || key.to_lowercase().contains("time") {
                Some(PropertyValueType::DateTime)
            } else {
                Some(PropertyValueType::Numeric)
            }
        }
        Value::Bool(_) => Some(PropertyValueType::Boolean),
        _ => None,
    }
}

fn floor_to_day(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(chrono::Duration::days(1)).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryDefinitionsRepository, MemoryTeamRepository};
    use serde_json::json;

    fn setup(
        features: Option<Value>,
    ) -> (Arc<MemoryDefinitionsRepository>, DefinitionsManager, Team) {
        let org_id = Uuid::now_v7();
        let team = Team {
            id: 2,
            project_id: Some(2),
            organization_id: org_id,
            uuid: Uuid::now_v7(),
            name: "team".to_string(),
            api_token: "token".to_string(),
            anonymize_ips: false,
            session_recording_opt_in: false,
        };
        let teams = Arc::new(MemoryTeamRepository::default());
        teams.insert_team(team.clone());
        teams.insert_organization(crate::types::Organization {
            id: org_id,
            name: "org".to_string(),
            available_product_features: features,
        });
        let repository = Arc::new(MemoryDefinitionsRepository::default());
        let config = Config::default_test_config();
        let manager = DefinitionsManager::new(
            repository.clone(),
            Arc::new(TeamManager::new(teams, &config)),
            &config,
        );
        (repository, manager, team)
    }

    fn props(value: Value) -> Properties {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn test_event_and_property_definitions_recorded() {
        let (repository, manager, team) = setup(None);
        let properties = props(json!({
            "$browser": "Firefox",
            "price": 42,
            "$set": {"plan": "pro"}
        }));

        manager
            .register_event(&team, "purchase", &properties)
            .await
            .unwrap();

        assert_eq!(repository.event_definitions(), vec!["purchase".to_string()]);
        let props = repository.property_definitions();
        assert!(props
            .iter()
            .any(|d| d.name == "$browser" && d.parent_type == PropertyParentType::Event));
        assert!(props
            .iter()
            .any(|d| d.name == "price" && d.is_numerical));
        assert!(props
            .iter()
            .any(|d| d.name == "plan" && d.parent_type == PropertyParentType::Person));
        // $set itself is metadata, not a property
        assert!(!props.iter().any(|d| d.name == "$set"));
    }

    #[tokio::test]
    async fn test_repeat_events_dedupe_in_cache() {
        let (repository, manager, team) = setup(None);
        let properties = props(json!({"$browser": "Firefox"}));

        manager
            .register_event(&team, "pageview", &properties)
            .await
            .unwrap();
        manager
            .register_event(&team, "pageview", &properties)
            .await
            .unwrap();

        assert_eq!(repository.event_definitions().len(), 1);
        assert_eq!(repository.event_property_count(), 1);
    }

    #[tokio::test]
    async fn test_excluded_events_are_skipped() {
        let (repository, manager, team) = setup(None);
        manager
            .register_event(&team, "$$plugin_metrics", &Properties::new())
            .await
            .unwrap();
        assert!(repository.event_definitions().is_empty());
    }

    #[tokio::test]
    async fn test_property_types_gated_on_organization_feature() {
        let (repository, manager, team) =
            setup(Some(json!([{"key": "ingestion_taxonomy"}])));
        manager
            .register_event(&team, "pageview", &props(json!({"price": 42})))
            .await
            .unwrap();
        let defs = repository.property_definitions();
        assert_eq!(
            defs.iter().find(|d| d.name == "price").unwrap().property_type,
            Some(PropertyValueType::Numeric)
        );

        let (repository, manager, team) = setup(None);
        manager
            .register_event(&team, "pageview", &props(json!({"price": 42})))
            .await
            .unwrap();
        let defs = repository.property_definitions();
        assert_eq!(
            defs.iter().find(|d| d.name == "price").unwrap().property_type,
            None
        );
    }

    #[test]
    fn test_detect_property_type() {
        assert_eq!(
            detect_property_type("utm_source", &json!(123)),
            Some(PropertyValueType::String)
        );
        assert_eq!(
            detect_property_type("$feature/foo", &json!(true)),
            Some(PropertyValueType::String)
        );
        assert_eq!(
            detect_property_type("price", &json!(9.99)),
            Some(PropertyValueType::Numeric)
        );
        assert_eq!(
            detect_property_type("login_timestamp", &json!(1700000000)),
            Some(PropertyValueType::DateTime)
        );
        assert_eq!(
            detect_property_type("enabled", &json!("True")),
            Some(PropertyValueType::Boolean)
        );
        assert_eq!(detect_property_type("tags", &json!(["a"])), None);
    }
}
