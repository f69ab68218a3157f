// We do this pattern (privately use a module, then re-export parts of it) so we
// can refactor the internals without breaking the public API.

// Event and entity types
mod types;
pub use types::CanonicalEvent;
pub use types::Organization;
pub use types::Person;
pub use types::PluginEvent;
pub use types::Properties;
pub use types::SessionRecordingEvent;
pub use types::Team;
pub use types::TeamId;

// Identifiers
mod ids;
pub use ids::new_event_uuid;
pub use ids::parse_event_uuid;

// Timestamp reconciliation
mod timestamp;
pub use timestamp::parse_event_timestamp;

// Element chains
mod elements;
pub use elements::elements_to_string;
pub use elements::extract_elements;
pub use elements::hash_elements;
pub use elements::Element;

// Timestamp wire formats shared by the sinks and the mirror messages
mod formats;
pub use formats::format_ch_datetime;
pub use formats::parse_ch_datetime;

// Error taxonomy
mod error;
pub use error::IngestionError;
pub use error::PluginError;
pub use error::ProducerError;
pub use error::SinkError;
pub use error::StoreError;
pub use error::WorkerError;

// Log producer seam
mod producer;
pub use producer::create_kafka_producer;
pub use producer::KafkaMessageProducer;
pub use producer::LogMessage;
pub use producer::MessageProducer;

// Error sink (ingestion warnings)
mod warnings;
pub use warnings::report_ingestion_warning;
pub use warnings::IngestionWarning;
pub use warnings::WarningReport;

// Team config replication
mod team_manager;
pub use team_manager::PostgresTeamRepository;
pub use team_manager::TeamManager;
pub use team_manager::TeamRepository;

// Event and property definitions
mod definitions;
pub use definitions::DefinitionsManager;
pub use definitions::DefinitionsRepository;
pub use definitions::PostgresDefinitionsRepository;
pub use definitions::PropertyDefinitionUpsert;
pub use definitions::PropertyParentType;
pub use definitions::PropertyValueType;
pub use definitions::EVENTS_WITHOUT_DEFINITIONS;

// Person state
mod person;
pub use person::ColumnarClient;
pub use person::PersonManager;
pub use person::PersonPatch;
pub use person::PersonRepository;
pub use person::PersonStore;
pub use person::PostgresPersonRepository;

// Identity resolution
mod identity;
pub use identity::IdentityResolver;

// Sinks
mod sink;
pub use sink::wire;
pub use sink::EventSink;
pub use sink::KafkaEventSink;
pub use sink::PostgresEventSink;

// Emission
mod emitter;
pub use emitter::CaptureOutcome;
pub use emitter::EventEmitter;

// Per-event orchestration
mod processor;
pub use processor::EventProcessor;
pub use processor::ProcessedEvent;

// Plugin VM seam
mod plugin;
pub use plugin::EventTransformer;
pub use plugin::EventTransformerFactory;
pub use plugin::NoopTransformer;
pub use plugin::PluginLogEntry;
pub use plugin::PluginLogEntrySource;
pub use plugin::PluginLogEntryType;

// Worker pool
mod worker;
pub use worker::Task;
pub use worker::TaskResult;
pub use worker::WorkerPool;

// Construction-time wiring
mod app_context;
pub use app_context::AppContext;

// Config
mod config;
pub use config::Config;

mod metrics_consts;
mod metrics_utils;

// In-memory fakes for the storage and producer seams, shared by the unit and
// scenario tests.
pub mod testing;
