pub(crate) mod archive;
mod logic;
pub(crate) mod mongo_export;
pub(crate) mod pg_export;

pub use archive::{ArchiveEntry, bundle};
pub use logic::{BackupRun, Orchestrator};
pub use mongo_export::MongoExporter;
pub use pg_export::PgExporter;
