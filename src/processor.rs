//! Top-level per-event orchestration: sanitize, timestamp, identify,
//! capture-or-snapshot, emit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::app_context::AppContext;
use crate::emitter::CaptureOutcome;
use crate::error::IngestionError;
use crate::ids::{new_event_uuid, parse_event_uuid};
use crate::metrics_consts::{EVENT_PROCESSED_DURATION, IDENTITY_FAILURES_SWALLOWED};
use crate::timestamp::parse_event_timestamp;
use crate::types::{PluginEvent, Properties};
use crate::warnings::report_ingestion_warning;

pub struct EventProcessor {
    context: Arc<AppContext>,
}

/// What processing produced. Snapshots have no canonical analytics event.
pub enum ProcessedEvent {
    Captured(Box<CaptureOutcome>),
    Snapshot,
}

impl EventProcessor {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    pub async fn process_event(
        &self,
        event: PluginEvent,
    ) -> Result<ProcessedEvent, IngestionError> {
        let event_uuid = parse_event_uuid(event.uuid.as_deref())?;

        let watchdog_ms = self.context.config.task_watchdog_ms;
        let _watchdog = Watchdog::arm(
            Duration::from_millis(watchdog_ms),
            format!("process_event({})", event.event),
        );
        let started = Instant::now();

        let mut properties = event.properties.clone();
        merge_toplevel_updates(&mut properties, "$set", event.set.as_ref());
        merge_toplevel_updates(&mut properties, "$set_once", event.set_once.as_ref());

        // Only used if a person ends up lazily created for this distinct id.
        let person_uuid = new_event_uuid();

        let now = parse_client_instant(Some(&event.now)).unwrap_or_else(Utc::now);
        let sent_at = match &event.sent_at {
            Some(raw) => {
                let parsed = parse_client_instant(Some(raw));
                if parsed.is_none() {
                    warn!(team_id = event.team_id, sent_at = %raw, "unparseable sent_at");
                }
                parsed
            }
            None => None,
        };
        let ignore_sent_at = properties
            .get("$ignore_sent_at")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let (timestamp, timestamp_warnings) = parse_event_timestamp(
            event.timestamp.as_deref(),
            event.offset,
            sent_at,
            ignore_sent_at,
            now,
        );
        for warning in timestamp_warnings {
            report_ingestion_warning(
                self.context.producer.as_ref(),
                &self.context.config.ingestion_warnings_topic,
                event.team_id,
                "event_processor",
                warning.warning_type,
                warning.details,
            )
            .await;
        }

        // Identity resolution is best-effort: the event must record even when
        // the identity state machine loses every race.
        {
            let _identity_watchdog = Watchdog::arm(
                Duration::from_millis(watchdog_ms),
                format!("identify({})", event.distinct_id),
            );
            if let Err(e) = self
                .context
                .identity
                .handle_identify_or_alias(
                    &event.event,
                    &properties,
                    &event.distinct_id,
                    event.team_id,
                )
                .await
            {
                metrics::counter!(IDENTITY_FAILURES_SWALLOWED).increment(1);
                error!(
                    team_id = event.team_id,
                    distinct_id = %event.distinct_id,
                    event = %event.event,
                    "identity resolution failed, recording event anyway: {e}"
                );
                report_ingestion_warning(
                    self.context.producer.as_ref(),
                    &self.context.config.ingestion_warnings_topic,
                    event.team_id,
                    "event_processor",
                    "identity_resolution_failed",
                    HashMap::from([
                        ("event".to_string(), json!(event.event)),
                        ("distinctId".to_string(), json!(event.distinct_id)),
                        ("eventUuid".to_string(), json!(event_uuid.to_string())),
                        ("error".to_string(), json!(e.to_string())),
                    ]),
                )
                .await;
            }
        }

        let outcome = if event.event == "$snapshot" {
            self.context
                .emitter
                .emit_snapshot(
                    event_uuid,
                    person_uuid,
                    event.ip.as_deref(),
                    event.team_id,
                    &event.distinct_id,
                    properties,
                    timestamp,
                )
                .await?;
            ProcessedEvent::Snapshot
        } else {
            let captured = self
                .context
                .emitter
                .capture(
                    event_uuid,
                    person_uuid,
                    event.ip.as_deref(),
                    event.team_id,
                    &event.event,
                    &event.distinct_id,
                    properties,
                    timestamp,
                )
                .await?;
            ProcessedEvent::Captured(Box::new(captured))
        };

        metrics::histogram!(EVENT_PROCESSED_DURATION, "team_id" => event.team_id.to_string())
            .record(started.elapsed().as_millis() as f64);

        Ok(outcome)
    }
}

/// Merge a top-level `$set` / `$set_once` block into properties. The
/// property-level block wins on key conflicts.
fn merge_toplevel_updates(properties: &mut Properties, key: &str, toplevel: Option<&Properties>) {
    let Some(toplevel) = toplevel else {
        return;
    };
    let mut merged = toplevel.clone();
    if let Some(Value::Object(existing)) = properties.get(key) {
        for (k, v) in existing {
            merged.insert(k.clone(), v.clone());
        }
    }
    properties.insert(key.to_string(), Value::Object(merged));
}

fn parse_client_instant(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}

/// Log-only timer: warns when the guarded section outlives the deadline, but
/// never cancels it.
struct Watchdog {
    handle: tokio::task::JoinHandle<()>,
}

impl Watchdog {
    fn arm(deadline: Duration, label: String) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            warn!(
                "{} still running after {}ms, proceeding anyway",
                label,
                deadline.as_millis()
            );
        });
        Self { handle }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
