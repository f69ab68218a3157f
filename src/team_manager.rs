use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache;
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use tracing::debug;
use uuid::Uuid;

use crate::config::Config;
use crate::error::StoreError;
use crate::metrics_consts::{DB_QUERY_DURATION, TEAM_CACHE_HITS, TEAM_CACHE_MISSES};
use crate::types::{Organization, Team, TeamId};

#[async_trait]
pub trait TeamRepository: Send + Sync {
    async fn fetch_team(&self, team_id: TeamId) -> Result<Option<Team>, StoreError>;
    async fn fetch_organization(
        &self,
        organization_id: Uuid,
    ) -> Result<Option<Organization>, StoreError>;
}

pub struct PostgresTeamRepository {
    pool: PgPool,
}

impl PostgresTeamRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, Clone, FromRow)]
struct OrganizationRow {
    id: Uuid,
    name: String,
    available_product_features: Option<serde_json::Value>,
}

#[async_trait]
impl TeamRepository for PostgresTeamRepository {
    async fn fetch_team(&self, team_id: TeamId) -> Result<Option<Team>, StoreError> {
        let labels = [("operation".to_string(), "fetch_team".to_string())];
        let _timer = crate::metrics_utils::timing_guard(DB_QUERY_DURATION, &labels);

        let team = sqlx::query_as::<_, Team>(
            r#"
            SELECT id, project_id, organization_id, uuid, name, api_token,
                   anonymize_ips, session_recording_opt_in
            FROM posthog_team
            WHERE id = $1
            LIMIT 1
            "#,
        )
        .bind(team_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(team)
    }

    async fn fetch_organization(
        &self,
        organization_id: Uuid,
    ) -> Result<Option<Organization>, StoreError> {
        let labels = [("operation".to_string(), "fetch_organization".to_string())];
        let _timer = crate::metrics_utils::timing_guard(DB_QUERY_DURATION, &labels);

        let row = sqlx::query_as::<_, OrganizationRow>(
            r#"
            SELECT id, name, available_product_features
            FROM posthog_organization
            WHERE id = $1
            LIMIT 1
            "#,
        )
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Organization {
            id: r.id,
            name: r.name,
            available_product_features: r.available_product_features,
        }))
    }
}

/// Read-through, TTL-bounded replication of per-team config. Misses (team
/// deleted or unknown) are cached too, so a flood of events for a dead team
/// does not hammer postgres.
pub struct TeamManager {
    repository: Arc<dyn TeamRepository>,
    teams: Cache<TeamId, Option<Arc<Team>>>,
    organizations: Cache<Uuid, Option<Arc<Organization>>>,
}

impl TeamManager {
    pub fn new(repository: Arc<dyn TeamRepository>, config: &Config) -> Self {
        let teams = Cache::builder()
            .max_capacity(config.team_cache_capacity)
            .time_to_live(Duration::from_secs(config.team_cache_ttl_secs))
            .build();
        let organizations = Cache::builder()
            .max_capacity(config.team_cache_capacity)
            .time_to_live(Duration::from_secs(config.team_cache_ttl_secs))
            .build();
        Self {
            repository,
            teams,
            organizations,
        }
    }

    pub async fn get_team(&self, team_id: TeamId) -> Result<Option<Arc<Team>>, StoreError> {
        if let Some(cached) = self.teams.get(&team_id) {
            metrics::counter!(TEAM_CACHE_HITS).increment(1);
            return Ok(cached);
        }
        metrics::counter!(TEAM_CACHE_MISSES).increment(1);
        debug!(team_id = team_id, "team cache miss");

        // Racing refreshes are harmless: last write wins, values are equal.
        let team = self.repository.fetch_team(team_id).await?.map(Arc::new);
        self.teams.insert(team_id, team.clone());
        Ok(team)
    }

    pub async fn get_organization(
        &self,
        organization_id: Uuid,
    ) -> Result<Option<Arc<Organization>>, StoreError> {
        if let Some(cached) = self.organizations.get(&organization_id) {
            return Ok(cached);
        }

        let organization = self
            .repository
            .fetch_organization(organization_id)
            .await?
            .map(Arc::new);
        self.organizations
            .insert(organization_id, organization.clone());
        Ok(organization)
    }

    /// Drop a team from the cache so the next read observes fresh config.
    pub fn invalidate(&self, team_id: TeamId) {
        self.teams.invalidate(&team_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryTeamRepository;

    fn test_team(id: TeamId) -> Team {
        Team {
            id,
            project_id: Some(id as i64),
            organization_id: Uuid::now_v7(),
            uuid: Uuid::now_v7(),
            name: format!("team-{id}"),
            api_token: format!("token-{id}"),
            anonymize_ips: false,
            session_recording_opt_in: true,
        }
    }

    #[tokio::test]
    async fn test_read_through_and_cache_hit() {
        let repository = Arc::new(MemoryTeamRepository::default());
        repository.insert_team(test_team(2));
        let manager = TeamManager::new(repository.clone(), &Config::default_test_config());

        let team = manager.get_team(2).await.unwrap().unwrap();
        assert_eq!(team.name, "team-2");
        assert_eq!(repository.team_fetches(), 1);

        let again = manager.get_team(2).await.unwrap().unwrap();
        assert_eq!(again.id, 2);
        assert_eq!(repository.team_fetches(), 1);
    }

    #[tokio::test]
    async fn test_missing_team_is_negative_cached() {
        let repository = Arc::new(MemoryTeamRepository::default());
        let manager = TeamManager::new(repository.clone(), &Config::default_test_config());

        assert!(manager.get_team(404).await.unwrap().is_none());
        assert!(manager.get_team(404).await.unwrap().is_none());
        assert_eq!(repository.team_fetches(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh() {
        let repository = Arc::new(MemoryTeamRepository::default());
        repository.insert_team(test_team(7));
        let manager = TeamManager::new(repository.clone(), &Config::default_test_config());

        manager.get_team(7).await.unwrap();
        manager.invalidate(7);
        manager.get_team(7).await.unwrap();
        assert_eq!(repository.team_fetches(), 2);
    }
}
