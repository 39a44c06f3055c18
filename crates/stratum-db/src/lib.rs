pub mod ledger;
pub mod memory_store;
pub mod migrations;
pub mod runner;
pub mod sqlite_ledger;
pub mod sqlite_store;
pub mod store;

pub use ledger::{JsonFileLedger, Ledger, LedgerEntry, MemoryLedger};
pub use memory_store::MemoryStore;
pub use migrations::{Migration, SchemaChange};
pub use runner::{
    Direction, MigrationRunner, MigrationState, MigrationStatus, RevertTarget, RunReport, status,
};
pub use sqlite_ledger::SqliteLedger;
pub use sqlite_store::SqliteStore;
pub use store::{Store, StoreLock};
