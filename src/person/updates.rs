//! The person-property update protocol: `$set`, `$set_once` and `$increment`
//! applied against a lazily created, concurrently mutated person row.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::error::StoreError;
use crate::person::store::{PersonPatch, PersonStore};
use crate::types::{Person, Properties, TeamId};

impl PersonStore {
    /// Apply a property update for `(team_id, distinct_id)`.
    ///
    /// The person is created if absent (optimistically; the unique constraint
    /// arbitrates races). New properties are `set_once ⊕ existing ⊕ set`:
    /// `set` wins over existing values, `set_once` only fills absent keys.
    /// Increments are atomic in SQL so concurrent updates never lose counts.
    ///
    /// Returns the written person, or `None` when nothing needed writing.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_person_properties(
        &self,
        team_id: TeamId,
        distinct_id: &str,
        person_uuid: Uuid,
        timestamp: DateTime<Utc>,
        set: &Properties,
        set_once: &Properties,
        increments: &Properties,
    ) -> Result<Option<Person>, StoreError> {
        let numeric_increments = filter_numeric_increments(team_id, increments);

        let person = match self.fetch(team_id, distinct_id).await? {
            Some(person) => person,
            None => {
                let mut initial = set_once.clone();
                for (key, value) in set {
                    initial.insert(key.clone(), value.clone());
                }
                match self
                    .create(
                        timestamp,
                        initial,
                        team_id,
                        None,
                        false,
                        person_uuid,
                        &[distinct_id.to_string()],
                    )
                    .await
                {
                    Ok(person) => person,
                    Err(StoreError::RaceCondition(_)) => self
                        .fetch(team_id, distinct_id)
                        .await?
                        .ok_or(StoreError::NotFound)?,
                    Err(e) => return Err(e),
                }
            }
        };

        let mut new_properties = person.properties.clone();
        for (key, value) in set_once {
            new_properties
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        for (key, value) in set {
            new_properties.insert(key.clone(), value.clone());
        }

        if !numeric_increments.is_empty() {
            if let Some(after) = self
                .apply_increments(&person, &numeric_increments)
                .await?
            {
                for (key, _) in &numeric_increments {
                    if let Some(value) = after.get(key) {
                        new_properties.insert(key.clone(), value.clone());
                    }
                }
            }
        }

        if new_properties == person.properties
            && (!self.has_log_producer() || numeric_increments.is_empty())
        {
            return Ok(None);
        }

        let updated = self
            .update(
                &person,
                PersonPatch {
                    properties: Some(new_properties),
                    ..Default::default()
                },
            )
            .await?;
        Ok(Some(updated))
    }
}

fn filter_numeric_increments(team_id: TeamId, increments: &Properties) -> Vec<(String, i64)> {
    increments
        .iter()
        .filter_map(|(key, value)| match value {
            Value::Number(n) if n.as_i64().is_some() => {
                Some((key.clone(), n.as_i64().unwrap_or(0)))
            }
            _ => {
                warn!(
                    team_id = team_id,
                    key = key.as_str(),
                    "dropping non-numeric $increment value"
                );
                None
            }
        })
        .collect()
}
