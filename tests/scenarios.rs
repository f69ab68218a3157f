//! End-to-end scenarios over the full processing pipeline, with the storage
//! and producer seams replaced by in-memory fakes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use ingestion_core::testing::{
    MemoryDefinitionsRepository, MemoryPersonRepository, MemoryTeamRepository,
    RecordingColumnarClient, RecordingProducer, RecordingSink,
};
use ingestion_core::{
    format_ch_datetime, wire, AppContext, Config, EventProcessor, EventSink, IngestionError,
    KafkaEventSink, MessageProducer, PersonStore, PluginEvent, Properties, Team,
};

struct Harness {
    processor: EventProcessor,
    person_store: Arc<PersonStore>,
    persons: Arc<MemoryPersonRepository>,
    sink: Arc<RecordingSink>,
    producer: Arc<RecordingProducer>,
}

fn test_team(id: i32) -> Team {
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

fn harness() -> Harness {
    harness_with(Config::default_test_config(), false)
}

fn harness_with(config: Config, with_columnar: bool) -> Harness {
    let persons = Arc::new(MemoryPersonRepository::default());
    let teams = Arc::new(MemoryTeamRepository::default());
    teams.insert_team(test_team(2));
    let definitions = Arc::new(MemoryDefinitionsRepository::default());
    let producer = Arc::new(RecordingProducer::default());
    let sink = Arc::new(RecordingSink::default());
    let columnar = with_columnar.then(|| {
        Arc::new(RecordingColumnarClient::default()) as Arc<dyn ingestion_core::ColumnarClient>
    });

    let context = AppContext::new(
        config,
        teams,
        definitions,
        persons.clone(),
        Some(producer.clone() as Arc<dyn MessageProducer>),
        columnar,
        sink.clone() as Arc<dyn EventSink>,
    );
    Harness {
        processor: EventProcessor::new(context.clone()),
        person_store: context.person_store.clone(),
        persons,
        sink,
        producer,
    }
}

fn base_event(name: &str, distinct_id: &str) -> PluginEvent {
    serde_json::from_value(json!({
        "distinct_id": distinct_id,
        "ip": null,
        "site_url": "https://example.com",
        "team_id": 2,
        "now": "2024-01-01T00:00:00Z",
        "event": name,
        "properties": {}
    }))
    .unwrap()
}

fn utc(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn props(value: Value) -> Properties {
    value.as_object().unwrap().clone()
}

// S1 — implicit create on first sighting of a distinct id.
#[tokio::test]
async fn test_implicit_create_on_empty_state() {
    let h = harness();

    h.processor
        .process_event(base_event("pageview", "d1"))
        .await
        .unwrap();

    assert_eq!(h.persons.person_count(), 1);
    let person = h.person_store.fetch(2, "d1").await.unwrap().unwrap();
    assert!(!person.is_identified);

    let mapping = h.persons.distinct_ids_of(2);
    assert_eq!(mapping.len(), 1);
    assert_eq!(mapping[0].0, "d1");

    let events = h.sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, "pageview");
    assert_eq!(events[0].distinct_id, "d1");
    assert_eq!(events[0].team_id, 2);
    assert_eq!(
        format_ch_datetime(events[0].timestamp),
        "2024-01-01 00:00:00.000000"
    );

    // Mirror messages follow the relational commit.
    assert_eq!(h.producer.message_count("clickhouse_person"), 1);
    assert_eq!(h.producer.message_count("clickhouse_person_distinct_id"), 1);
}

// S2 — clock-skew correction from sent_at.
#[tokio::test]
async fn test_clock_skew_correction() {
    let h = harness();

    let mut event = base_event("pageview", "d1");
    event.timestamp = Some("2023-12-31T23:59:50Z".to_string());
    event.sent_at = Some("2023-12-31T23:59:55Z".to_string());
    event.now = "2024-01-01T00:00:05Z".to_string();

    h.processor.process_event(event).await.unwrap();

    let events = h.sink.events();
    assert_eq!(events[0].timestamp, utc("2024-01-01T00:00:00Z"));
}

// S3 — $create_alias merges two existing persons.
#[tokio::test]
async fn test_alias_merges_two_people() {
    let h = harness();
    let t0 = utc("2023-06-01T00:00:00Z");

    h.person_store
        .create(
            t0,
            props(json!({"color": "red", "from_a": true})),
            2,
            None,
            false,
            Uuid::now_v7(),
            &["a".to_string()],
        )
        .await
        .unwrap();
    let person_b = h
        .person_store
        .create(
            t0 + chrono::Duration::seconds(10),
            props(json!({"color": "blue"})),
            2,
            None,
            false,
            Uuid::now_v7(),
            &["b".to_string()],
        )
        .await
        .unwrap();

    let mut event = base_event("$create_alias", "b");
    event.properties = props(json!({"alias": "a"}));
    h.processor.process_event(event).await.unwrap();

    // Person A is gone, both distinct ids map to B.
    assert_eq!(h.persons.person_count(), 1);
    let merged = h.person_store.fetch(2, "a").await.unwrap().unwrap();
    assert_eq!(merged.id, person_b.id);
    assert_eq!(h.person_store.fetch(2, "b").await.unwrap().unwrap().id, person_b.id);

    // First seen wins, B's properties win on conflict.
    assert_eq!(merged.created_at, t0);
    assert_eq!(merged.properties["color"], json!("blue"));
    assert_eq!(merged.properties["from_a"], json!(true));
}

// S4 — two workers race an $identify for the same fresh distinct id.
#[tokio::test]
async fn test_concurrent_identify_creates_one_person() {
    let h = harness();

    let event_a = base_event("$identify", "d2");
    let event_b = base_event("$identify", "d2");
    let (left, right) = tokio::join!(
        h.processor.process_event(event_a),
        h.processor.process_event(event_b)
    );
    left.unwrap();
    right.unwrap();

    assert_eq!(h.persons.person_count(), 1);
    assert_eq!(h.persons.distinct_ids_of(2).len(), 1);
    assert!(h.person_store.fetch(2, "d2").await.unwrap().unwrap().is_identified);
}

// S5 — a peer attaches a distinct id to the losing person mid-merge; the
// delete fails on the foreign key, the loop re-moves and retries.
#[tokio::test]
async fn test_merge_retries_past_concurrent_distinct_id_addition() {
    let h = harness();
    let t0 = utc("2023-06-01T00:00:00Z");

    h.person_store
        .create(t0, Properties::new(), 2, None, false, Uuid::now_v7(), &["a".to_string()])
        .await
        .unwrap();
    let person_b = h
        .person_store
        .create(
            t0 + chrono::Duration::seconds(10),
            Properties::new(),
            2,
            None,
            false,
            Uuid::now_v7(),
            &["b".to_string()],
        )
        .await
        .unwrap();

    h.persons.add_distinct_id_during_next_delete("x");

    let mut event = base_event("$create_alias", "b");
    event.properties = props(json!({"alias": "a"}));
    h.processor.process_event(event).await.unwrap();

    assert_eq!(h.persons.person_count(), 1);
    let mut mapping = h.persons.distinct_ids_of(2);
    mapping.sort();
    assert_eq!(
        mapping,
        vec![
            ("a".to_string(), person_b.id),
            ("b".to_string(), person_b.id),
            ("x".to_string(), person_b.id),
        ]
    );
}

// S6 — $set_once only fills keys the person does not have yet.
#[tokio::test]
async fn test_set_once_does_not_overwrite_existing() {
    let h = harness();

    h.person_store
        .create(
            utc("2023-06-01T00:00:00Z"),
            props(json!({"color": "red"})),
            2,
            None,
            false,
            Uuid::now_v7(),
            &["d1".to_string()],
        )
        .await
        .unwrap();

    let mut event = base_event("pageview", "d1");
    event.properties = props(json!({"$set_once": {"color": "blue", "size": "L"}}));
    h.processor.process_event(event).await.unwrap();

    let person = h.person_store.fetch(2, "d1").await.unwrap().unwrap();
    assert_eq!(person.properties["color"], json!("red"));
    assert_eq!(person.properties["size"], json!("L"));
}

// The log sink's wire format round-trips the canonical timestamp losslessly.
#[tokio::test]
async fn test_log_sink_wire_round_trip() {
    let persons = Arc::new(MemoryPersonRepository::default());
    let teams = Arc::new(MemoryTeamRepository::default());
    teams.insert_team(test_team(2));
    let producer = Arc::new(RecordingProducer::default());
    let config = Config::default_test_config();
    let kafka_sink = Arc::new(KafkaEventSink::new(
        producer.clone() as Arc<dyn MessageProducer>,
        &config,
    ));

    let context = AppContext::new(
        config,
        teams,
        Arc::new(MemoryDefinitionsRepository::default()),
        persons,
        Some(producer.clone() as Arc<dyn MessageProducer>),
        None,
        kafka_sink as Arc<dyn EventSink>,
    );
    let processor = EventProcessor::new(context);

    let mut event = base_event("pageview", "d1");
    event.timestamp = Some("2024-01-01T00:00:00.123456Z".to_string());
    event.properties = props(json!({"$browser": "Firefox"}));
    processor.process_event(event).await.unwrap();

    let messages = producer.messages_for("events");
    assert_eq!(messages.len(), 1);

    let decoded = wire::decode_event(&messages[0].payload).unwrap();
    assert_eq!(decoded.event, "pageview");
    assert_eq!(decoded.timestamp, utc("2024-01-01T00:00:00.123456Z"));
    assert_eq!(decoded.timestamp.timestamp_subsec_micros(), 123_456);
    // Keyed by event uuid for per-event partition ordering.
    assert_eq!(messages[0].key.as_deref(), Some(decoded.uuid.to_string().as_str()));
    let properties: Value = serde_json::from_str(&decoded.properties).unwrap();
    assert_eq!(properties["$browser"], json!("Firefox"));
}

#[tokio::test]
async fn test_snapshot_goes_to_recording_sink() {
    let h = harness();

    let mut event = base_event("$snapshot", "d1");
    event.properties = props(json!({
        "$session_id": "session-9",
        "$snapshot_data": {"type": 2, "data": {"x": 1}}
    }));
    h.processor.process_event(event).await.unwrap();

    // No analytics event, one snapshot, and the person still gets created.
    assert!(h.sink.events().is_empty());
    let snapshots = h.sink.snapshots();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].session_id, "session-9");
    let data: Value = serde_json::from_str(&snapshots[0].snapshot_data).unwrap();
    assert_eq!(data["type"], json!(2));
    assert_eq!(h.persons.person_count(), 1);
}

#[tokio::test]
async fn test_invalid_event_uuid_fails_the_event() {
    let h = harness();

    let mut event = base_event("pageview", "d1");
    event.uuid = Some("not-a-uuid".to_string());
    let result = h.processor.process_event(event).await;

    assert!(matches!(result, Err(IngestionError::InvalidUuid(_))));
    assert!(h.sink.events().is_empty());
}

#[tokio::test]
async fn test_unknown_team_fails_the_event() {
    let h = harness();

    let mut event = base_event("pageview", "d1");
    event.team_id = 99;
    let result = h.processor.process_event(event).await;

    assert!(matches!(result, Err(IngestionError::UnknownTeam(99))));
}

// Identity failures are swallowed and reported; the event still records.
#[tokio::test]
async fn test_identity_failure_still_records_event() {
    let mut config = Config::default_test_config();
    config.max_merge_attempts = 1;
    let h = harness_with(config, false);
    let t0 = utc("2023-06-01T00:00:00Z");

    h.person_store
        .create(t0, Properties::new(), 2, None, false, Uuid::now_v7(), &["a".to_string()])
        .await
        .unwrap();
    h.person_store
        .create(t0, Properties::new(), 2, None, false, Uuid::now_v7(), &["b".to_string()])
        .await
        .unwrap();

    // With a budget of one, the first delete failure exhausts the merge.
    h.persons.add_distinct_id_during_next_delete("x");

    let mut event = base_event("$create_alias", "b");
    event.properties = props(json!({"alias": "a"}));
    h.processor.process_event(event).await.unwrap();

    // The event recorded despite the failed merge, and the failure landed in
    // the error sink.
    assert_eq!(h.sink.events().len(), 1);
    assert!(h.producer.message_count("clickhouse_ingestion_warnings") >= 1);
    // Both persons still exist; the merge never completed.
    assert_eq!(h.persons.person_count(), 2);
}

// Merge deletes issue columnar tombstones for both tables, keyed by uuid.
#[tokio::test]
async fn test_merge_issues_columnar_tombstones() {
    let persons = Arc::new(MemoryPersonRepository::default());
    let teams = Arc::new(MemoryTeamRepository::default());
    teams.insert_team(test_team(2));
    let columnar = Arc::new(RecordingColumnarClient::default());
    let sink = Arc::new(RecordingSink::default());

    let context = AppContext::new(
        Config::default_test_config(),
        teams,
        Arc::new(MemoryDefinitionsRepository::default()),
        persons,
        None,
        Some(columnar.clone() as Arc<dyn ingestion_core::ColumnarClient>),
        sink as Arc<dyn EventSink>,
    );
    let processor = EventProcessor::new(context.clone());
    let t0 = utc("2023-06-01T00:00:00Z");

    let person_a = context
        .person_store
        .create(t0, Properties::new(), 2, None, false, Uuid::now_v7(), &["a".to_string()])
        .await
        .unwrap();
    context
        .person_store
        .create(t0, Properties::new(), 2, None, false, Uuid::now_v7(), &["b".to_string()])
        .await
        .unwrap();

    let mut event = base_event("$create_alias", "b");
    event.properties = props(json!({"alias": "a"}));
    processor.process_event(event).await.unwrap();

    let queries = columnar.queries();
    assert_eq!(queries.len(), 2);
    assert!(queries[0].contains("ALTER TABLE person DELETE"));
    assert!(queries[0].contains(&person_a.uuid.to_string()));
    assert!(queries[1].contains("ALTER TABLE person_distinct_id DELETE"));
}

// Merges carry cohort memberships over to the surviving person.
#[tokio::test]
async fn test_merge_reassigns_cohort_memberships() {
    let h = harness();
    let t0 = utc("2023-06-01T00:00:00Z");

    let person_a = h
        .person_store
        .create(t0, Properties::new(), 2, None, false, Uuid::now_v7(), &["a".to_string()])
        .await
        .unwrap();
    let person_b = h
        .person_store
        .create(t0, Properties::new(), 2, None, false, Uuid::now_v7(), &["b".to_string()])
        .await
        .unwrap();
    h.persons.add_cohort_membership(person_a.id, 11);
    h.persons.add_cohort_membership(person_a.id, 12);
    h.persons.add_cohort_membership(person_b.id, 12);

    let mut event = base_event("$create_alias", "b");
    event.properties = props(json!({"alias": "a"}));
    h.processor.process_event(event).await.unwrap();

    let mut memberships = h.persons.cohort_memberships();
    memberships.sort();
    assert_eq!(memberships, vec![(person_b.id, 11), (person_b.id, 12)]);
}

// Autocaptured elements end up in the chain and off the properties map.
#[tokio::test]
async fn test_elements_extracted_into_chain() {
    let h = harness();

    let mut event = base_event("$autocapture", "d1");
    event.properties = props(json!({
        "$elements": [
            {"tag_name": "a", "$el_text": "Sign up", "attr__class": "btn"},
            {"tag_name": "div", "nth_child": 1}
        ]
    }));
    h.processor.process_event(event).await.unwrap();

    let events = h.sink.events();
    assert!(events[0].elements_chain.starts_with("a.btn:"));
    assert!(events[0].elements_chain.contains(";div:"));
    let properties: Value = serde_json::from_str(&events[0].properties).unwrap();
    assert!(properties.get("$elements").is_none());
    assert_eq!(h.sink.elements_of_last_event().len(), 2);
}

// Top-level $set blocks merge into properties and reach the person.
#[tokio::test]
async fn test_toplevel_set_reaches_person() {
    let h = harness();

    let mut event = base_event("pageview", "d1");
    event.set = Some(props(json!({"plan": "pro"})));
    h.processor.process_event(event).await.unwrap();

    let person = h.person_store.fetch(2, "d1").await.unwrap().unwrap();
    assert_eq!(person.properties["plan"], json!("pro"));
}
