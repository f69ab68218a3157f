//! Construction-time wiring. The processor and the identity resolver both
//! lean on the person store and the team cache; neither owns the other, so
//! everything hangs off one shared context built here.

use std::sync::Arc;

use crate::config::Config;
use crate::definitions::{DefinitionsManager, DefinitionsRepository};
use crate::emitter::EventEmitter;
use crate::identity::IdentityResolver;
use crate::person::{ColumnarClient, PersonManager, PersonRepository, PersonStore};
use crate::producer::MessageProducer;
use crate::sink::EventSink;
use crate::team_manager::{TeamManager, TeamRepository};

pub struct AppContext {
    pub config: Config,
    pub team_manager: Arc<TeamManager>,
    pub definitions: Arc<DefinitionsManager>,
    pub person_store: Arc<PersonStore>,
    pub person_manager: Arc<PersonManager>,
    pub identity: Arc<IdentityResolver>,
    pub emitter: Arc<EventEmitter>,
    pub producer: Option<Arc<dyn MessageProducer>>,
}

impl AppContext {
    pub fn new(
        config: Config,
        team_repository: Arc<dyn TeamRepository>,
        definitions_repository: Arc<dyn DefinitionsRepository>,
        person_repository: Arc<dyn PersonRepository>,
        producer: Option<Arc<dyn MessageProducer>>,
        columnar: Option<Arc<dyn ColumnarClient>>,
        sink: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let team_manager = Arc::new(TeamManager::new(team_repository, &config));
        let definitions = Arc::new(DefinitionsManager::new(
            definitions_repository,
            team_manager.clone(),
            &config,
        ));
        let person_store = Arc::new(PersonStore::new(
            person_repository,
            producer.clone(),
            columnar,
            config.person_topic.clone(),
            config.person_distinct_id_topic.clone(),
        ));
        let person_manager = Arc::new(PersonManager::new(person_store.clone(), &config));
        let identity = Arc::new(IdentityResolver::new(person_store.clone(), &config));
        let emitter = Arc::new(EventEmitter::new(
            team_manager.clone(),
            definitions.clone(),
            person_store.clone(),
            person_manager.clone(),
            sink,
        ));

        Arc::new(Self {
            config,
            team_manager,
            definitions,
            person_store,
            person_manager,
            identity,
            emitter,
            producer,
        })
    }
}
