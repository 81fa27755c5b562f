mod enricher;
mod ingest;

pub use enricher::Enricher;
pub use ingest::{IngestJob, IngestStats};
