mod manager;
mod store;
mod updates;

pub use manager::PersonManager;
pub use store::ColumnarClient;
pub use store::PersonPatch;
pub use store::PersonRepository;
pub use store::PersonStore;
pub use store::PostgresPersonRepository;
