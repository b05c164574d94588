pub mod connection;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_with_settings, DbPool};
pub use repositories::{
    InMemoryAuditRepository, InMemoryConversationRepository, InMemoryTaskRepository,
    InMemoryTimeEntryRepository, InMemoryUserRepository, RepositoryError, SqlAuditRepository,
    SqlConversationRepository, SqlTaskRepository, SqlTimeEntryRepository, SqlUserRepository,
};
