//! `$identify` / `$create_alias` semantics and the person merge protocol.
//!
//! Everything here runs concurrently with peer workers mutating the same
//! identity state. Unique constraints arbitrate creation races; the merge
//! protocol spans multiple transactions and compensates with a bounded retry
//! budget rather than holding locks.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::StoreError;
use crate::metrics_consts::MERGE_RETRIES;
use crate::person::{PersonPatch, PersonStore};
use crate::types::{Person, Properties, TeamId};
use crate::warnings::report_ingestion_warning;

pub struct IdentityResolver {
    store: Arc<PersonStore>,
    max_merge_attempts: u32,
    warnings_topic: String,
}

impl IdentityResolver {
    pub fn new(store: Arc<PersonStore>, config: &Config) -> Self {
        Self {
            store,
            max_merge_attempts: config.max_merge_attempts,
            warnings_topic: config.ingestion_warnings_topic.clone(),
        }
    }

    /// Identity dispatch for one event. Events other than `$identify` and
    /// `$create_alias` do no identity work here; the capture path ensures a
    /// person exists.
    pub async fn handle_identify_or_alias(
        &self,
        event: &str,
        properties: &Properties,
        distinct_id: &str,
        team_id: TeamId,
    ) -> Result<(), StoreError> {
        match event {
            "$create_alias" => match properties.get("alias").and_then(Value::as_str) {
                Some(alias) => {
                    self.alias(alias, distinct_id, team_id, true, 0).await?;
                }
                None => {
                    warn!(team_id = team_id, "$create_alias event without alias property");
                }
            },
            "$identify" => {
                if let Some(anon_distinct_id) =
                    properties.get("$anon_distinct_id").and_then(Value::as_str)
                {
                    self.alias(anon_distinct_id, distinct_id, team_id, true, 0)
                        .await?;
                }
                self.set_is_identified(team_id, distinct_id).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Mark the person behind `(team_id, distinct_id)` as identified,
    /// creating them if they do not exist yet.
    async fn set_is_identified(&self, team_id: TeamId, distinct_id: &str) -> Result<(), StoreError> {
        match self.store.fetch(team_id, distinct_id).await? {
            Some(person) if person.is_identified => Ok(()),
            Some(person) => {
                self.store
                    .update(
                        &person,
                        PersonPatch {
                            is_identified: Some(true),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(())
            }
            None => {
                let created = self
                    .store
                    .create(
                        Utc::now(),
                        Properties::new(),
                        team_id,
                        None,
                        true,
                        Uuid::now_v7(),
                        &[distinct_id.to_string()],
                    )
                    .await;
                match created {
                    Ok(_) => Ok(()),
                    Err(StoreError::RaceCondition(_)) => {
                        // Another worker won the create; it may not have set
                        // the flag, so re-observe and fix up.
                        if let Some(person) = self.store.fetch(team_id, distinct_id).await? {
                            if !person.is_identified {
                                self.store
                                    .update(
                                        &person,
                                        PersonPatch {
                                            is_identified: Some(true),
                                            ..Default::default()
                                        },
                                    )
                                    .await?;
                            }
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Declare that `previous_distinct_id` and `distinct_id` are the same
    /// person. `retry_if_conflict` allows one non-retrying restart to
    /// re-observe state after losing a race; `total_merge_attempts` carries
    /// the merge budget across restarts.
    pub fn alias<'a>(
        &'a self,
        previous_distinct_id: &'a str,
        distinct_id: &'a str,
        team_id: TeamId,
        retry_if_conflict: bool,
        total_merge_attempts: u32,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        async move {
            let previous_person = self.store.fetch(team_id, previous_distinct_id).await?;
            let new_person = self.store.fetch(team_id, distinct_id).await?;

            match (previous_person, new_person) {
                (Some(person), None) => {
                    self.attach_distinct_id(
                        &person,
                        distinct_id,
                        previous_distinct_id,
                        distinct_id,
                        team_id,
                        retry_if_conflict,
                        total_merge_attempts,
                    )
                    .await
                }
                (None, Some(person)) => {
                    self.attach_distinct_id(
                        &person,
                        previous_distinct_id,
                        previous_distinct_id,
                        distinct_id,
                        team_id,
                        retry_if_conflict,
                        total_merge_attempts,
                    )
                    .await
                }
                (None, None) => {
                    let created = self
                        .store
                        .create(
                            Utc::now(),
                            Properties::new(),
                            team_id,
                            None,
                            false,
                            Uuid::now_v7(),
                            &[distinct_id.to_string(), previous_distinct_id.to_string()],
                        )
                        .await;
                    match created {
                        Ok(_) => Ok(()),
                        Err(StoreError::RaceCondition(_)) if retry_if_conflict => {
                            self.alias(
                                previous_distinct_id,
                                distinct_id,
                                team_id,
                                false,
                                total_merge_attempts,
                            )
                            .await
                        }
                        Err(StoreError::RaceCondition(msg)) => {
                            self.swallow_conflict(team_id, previous_distinct_id, distinct_id, &msg)
                                .await;
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                (Some(other), Some(into)) if other.id != into.id => {
                    self.merge_people(
                        into,
                        other,
                        previous_distinct_id,
                        distinct_id,
                        team_id,
                        total_merge_attempts,
                    )
                    .await
                }
                (Some(_), Some(_)) => Ok(()),
            }
        }
        .boxed()
    }

    #[allow(clippy::too_many_arguments)]
    async fn attach_distinct_id(
        &self,
        person: &Person,
        distinct_id_to_add: &str,
        previous_distinct_id: &str,
        distinct_id: &str,
        team_id: TeamId,
        retry_if_conflict: bool,
        total_merge_attempts: u32,
    ) -> Result<(), StoreError> {
        match self.store.add_distinct_id(person, distinct_id_to_add).await {
            Ok(()) => Ok(()),
            Err(StoreError::RaceCondition(_)) if retry_if_conflict => {
                // A peer attached the id first; restart once, non-retrying,
                // to re-observe who owns what.
                self.alias(
                    previous_distinct_id,
                    distinct_id,
                    team_id,
                    false,
                    total_merge_attempts,
                )
                .await
            }
            Err(StoreError::RaceCondition(msg)) => {
                self.swallow_conflict(team_id, previous_distinct_id, distinct_id, &msg)
                    .await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Reconcile two persons into one. Not one transaction: a protocol over
    /// several, tolerating peers that add distinct ids or merge concurrently.
    async fn merge_people(
        &self,
        merge_into: Person,
        other_person: Person,
        previous_distinct_id: &str,
        distinct_id: &str,
        team_id: TeamId,
        total_merge_attempts: u32,
    ) -> Result<(), StoreError> {
        debug!(
            team_id = team_id,
            into = %merge_into.uuid,
            other = %other_person.uuid,
            "merging people"
        );

        let mut merged_properties = other_person.properties.clone();
        for (key, value) in &merge_into.properties {
            merged_properties.insert(key.clone(), value.clone());
        }
        let first_seen = merge_into.created_at.min(other_person.created_at);

        let merge_into = self
            .store
            .update(
                &merge_into,
                PersonPatch {
                    properties: Some(merged_properties),
                    created_at: Some(first_seen),
                    ..Default::default()
                },
            )
            .await?;

        self.store
            .reassign_cohorts(&other_person, &merge_into)
            .await?;

        let mut attempts = total_merge_attempts;
        loop {
            match self
                .store
                .move_distinct_ids(&other_person, &merge_into)
                .await
            {
                Ok(_) => {}
                Err(StoreError::RaceCondition(msg)) => {
                    attempts += 1;
                    metrics::counter!(MERGE_RETRIES, "kind" => "race").increment(1);
                    if attempts < self.max_merge_attempts {
                        // State moved under us; restart the protocol so it
                        // re-observes who is who.
                        return self
                            .alias(previous_distinct_id, distinct_id, team_id, false, attempts)
                            .await;
                    }
                    warn!(team_id = team_id, "merge retry budget exhausted: {msg}");
                    return Err(StoreError::MergeAttemptsExhausted(attempts));
                }
                Err(e) => return Err(e),
            }

            match self.store.delete(&other_person).await {
                Ok(()) => return Ok(()),
                Err(StoreError::ForeignKeyViolation(msg)) => {
                    // A distinct id landed on the losing person after the
                    // move; loop back to move it as well.
                    attempts += 1;
                    metrics::counter!(MERGE_RETRIES, "kind" => "delete").increment(1);
                    if attempts >= self.max_merge_attempts {
                        warn!(team_id = team_id, "merge retry budget exhausted: {msg}");
                        return Err(StoreError::MergeAttemptsExhausted(attempts));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn swallow_conflict(
        &self,
        team_id: TeamId,
        previous_distinct_id: &str,
        distinct_id: &str,
        message: &str,
    ) {
        warn!(
            team_id = team_id,
            "alias lost a second race, swallowing: {message}"
        );
        report_ingestion_warning(
            self.store.log_producer(),
            &self.warnings_topic,
            team_id,
            "identity_resolver",
            "alias_retry_conflict",
            HashMap::from([
                ("previousDistinctId".to_string(), json!(previous_distinct_id)),
                ("distinctId".to_string(), json!(distinct_id)),
            ]),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_person_store, MemoryPersonRepository};
    use serde_json::json;

    fn resolver(
        repository: Arc<MemoryPersonRepository>,
    ) -> (IdentityResolver, Arc<PersonStore>) {
        let store = Arc::new(memory_person_store(repository, None));
        (
            IdentityResolver::new(store.clone(), &Config::default_test_config()),
            store,
        )
    }

    fn props(value: serde_json::Value) -> Properties {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn test_identify_creates_identified_person() {
        let (resolver, store) = resolver(Arc::new(MemoryPersonRepository::default()));

        resolver
            .handle_identify_or_alias("$identify", &Properties::new(), "user-1", 2)
            .await
            .unwrap();

        let person = store.fetch(2, "user-1").await.unwrap().unwrap();
        assert!(person.is_identified);
    }

    #[tokio::test]
    async fn test_identify_flips_existing_person() {
        let (resolver, store) = resolver(Arc::new(MemoryPersonRepository::default()));
        store
            .create(
                Utc::now(),
                Properties::new(),
                2,
                None,
                false,
                Uuid::now_v7(),
                &["user-1".to_string()],
            )
            .await
            .unwrap();

        resolver
            .handle_identify_or_alias("$identify", &Properties::new(), "user-1", 2)
            .await
            .unwrap();

        assert!(store.fetch(2, "user-1").await.unwrap().unwrap().is_identified);
    }

    #[tokio::test]
    async fn test_identify_with_anon_id_attaches_both() {
        let (resolver, store) = resolver(Arc::new(MemoryPersonRepository::default()));

        resolver
            .handle_identify_or_alias(
                "$identify",
                &props(json!({"$anon_distinct_id": "anon-1"})),
                "user-1",
                2,
            )
            .await
            .unwrap();

        let by_anon = store.fetch(2, "anon-1").await.unwrap().unwrap();
        let by_user = store.fetch(2, "user-1").await.unwrap().unwrap();
        assert_eq!(by_anon.id, by_user.id);
        assert!(by_user.is_identified);
    }

    #[tokio::test]
    async fn test_alias_attaches_new_id_to_existing_person() {
        let (resolver, store) = resolver(Arc::new(MemoryPersonRepository::default()));
        let person = store
            .create(
                Utc::now(),
                Properties::new(),
                2,
                None,
                false,
                Uuid::now_v7(),
                &["a".to_string()],
            )
            .await
            .unwrap();

        resolver
            .handle_identify_or_alias("$create_alias", &props(json!({"alias": "a"})), "b", 2)
            .await
            .unwrap();

        assert_eq!(store.fetch(2, "b").await.unwrap().unwrap().id, person.id);
    }

    #[tokio::test]
    async fn test_alias_both_missing_creates_one_person() {
        let (resolver, store) = resolver(Arc::new(MemoryPersonRepository::default()));

        resolver
            .handle_identify_or_alias("$create_alias", &props(json!({"alias": "a"})), "b", 2)
            .await
            .unwrap();

        let a = store.fetch(2, "a").await.unwrap().unwrap();
        let b = store.fetch(2, "b").await.unwrap().unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_alias_same_person_is_noop() {
        let (resolver, store) = resolver(Arc::new(MemoryPersonRepository::default()));
        store
            .create(
                Utc::now(),
                Properties::new(),
                2,
                None,
                false,
                Uuid::now_v7(),
                &["a".to_string(), "b".to_string()],
            )
            .await
            .unwrap();

        resolver
            .handle_identify_or_alias("$create_alias", &props(json!({"alias": "a"})), "b", 2)
            .await
            .unwrap();

        assert_eq!(store.fetch(2, "a").await.unwrap().unwrap().id, store.fetch(2, "b").await.unwrap().unwrap().id);
    }

    #[tokio::test]
    async fn test_other_events_do_no_identity_work() {
        let (resolver, store) = resolver(Arc::new(MemoryPersonRepository::default()));

        resolver
            .handle_identify_or_alias("pageview", &Properties::new(), "d1", 2)
            .await
            .unwrap();

        assert!(store.fetch(2, "d1").await.unwrap().is_none());
    }
}
