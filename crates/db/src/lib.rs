pub mod connection;
pub mod crypto;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_from_config, connect_with_settings, DbPool};
pub use crypto::{CipherError, FieldCipher};
pub use repositories::{
    InMemoryTraceRepository, RepositoryError, SqlTraceRepository, TraceRepository,
};
