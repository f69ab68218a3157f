use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;

use crate::config::Config;
use crate::error::StoreError;
use crate::person::PersonStore;
use crate::types::TeamId;

/// Answers "is this distinct id new?" with a short-TTL cache in front, so a
/// burst of events for the same fresh distinct id does not turn into a burst
/// of create attempts across workers. False negatives are impossible (a
/// cached id was definitely checked); false positives just cost one create
/// attempt that the unique constraint absorbs.
pub struct PersonManager {
    store: Arc<PersonStore>,
    checked: Cache<String, ()>,
}

impl PersonManager {
    pub fn new(store: Arc<PersonStore>, config: &Config) -> Self {
        let checked = Cache::builder()
            .max_capacity(config.person_seen_cache_capacity)
            .time_to_live(Duration::from_secs(config.person_seen_cache_ttl_secs))
            .build();
        Self { store, checked }
    }

    pub async fn is_new_person(
        &self,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<bool, StoreError> {
        let key = format!("{team_id}:{distinct_id}");
        if self.checked.get(&key).is_some() {
            return Ok(false);
        }

        let exists = self.store.distinct_id_exists(team_id, distinct_id).await?;
        self.checked.insert(key, ());
        Ok(!exists)
    }
}
