mod memory;
mod surreal;

pub use memory::{InMemoryApplyRunRepository, InMemoryDraftRepository, InMemoryQuotaLedgerRepository};
pub use surreal::{
    SurrealApplyRunRepository, SurrealDraftRepository, SurrealQuotaLedgerRepository, ensure_schema,
};
