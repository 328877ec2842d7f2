mod memory;
pub use memory::MemoryLedgerStore;

#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "postgres")]
pub use postgres::PostgresLedgerStore;
