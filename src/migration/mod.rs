// ABOUTME: Data movement between relational engines and staged files
// ABOUTME: Export, import, dedup and identity remapping live here

pub mod dedup;
pub mod export;
pub mod identity;
pub mod import;

pub use dedup::{DedupPlan, DedupPolicy, Deduped};
pub use export::{export_tables, TableExport};
pub use identity::{ForeignKey, ForeignKeySchema, IdentityMap};
pub use import::{import_table, import_tables, ImportContext, ImportResult, TableImport};
