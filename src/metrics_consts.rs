pub const EVENT_PROCESSED_DURATION: &str = "ingestion_event_processed_ms";
pub const DB_QUERY_DURATION: &str = "ingestion_db_query_duration_ms";
pub const EVENTS_EMITTED: &str = "ingestion_events_emitted_total";
pub const SNAPSHOTS_EMITTED: &str = "ingestion_snapshots_emitted_total";
pub const PERSONS_CREATED: &str = "ingestion_persons_created_total";
pub const PERSON_CREATE_RACES: &str = "ingestion_person_create_races_total";
pub const MERGE_RETRIES: &str = "ingestion_merge_retries_total";
pub const IDENTITY_FAILURES_SWALLOWED: &str = "ingestion_identity_failures_swallowed_total";
pub const INGESTION_WARNINGS: &str = "ingestion_warnings_reported_total";
pub const TEAM_CACHE_HITS: &str = "ingestion_team_cache_hits_total";
pub const TEAM_CACHE_MISSES: &str = "ingestion_team_cache_misses_total";
pub const DEFINITIONS_UPSERTED: &str = "ingestion_definitions_upserted_total";
pub const PLUGIN_ERRORS: &str = "ingestion_plugin_errors_total";
pub const WORKER_TASKS_QUEUED: &str = "ingestion_worker_tasks_queued_total";
pub const WORKER_TASK_DURATION: &str = "ingestion_worker_task_duration_ms";
pub const WORKER_CRASHES: &str = "ingestion_worker_crashes_total";
