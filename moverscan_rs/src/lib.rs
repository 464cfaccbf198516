pub mod config;
pub mod dataset;
pub mod identity;
pub mod ingest;
pub mod master;
pub mod rank;
pub mod rules;
pub mod scan;
pub mod schema;
pub mod source;
pub mod storage;
pub mod window;

pub use config::{ChartMode, Config, ScanMode, Tolerance};
pub use dataset::{Bar, MasterDataset};
pub use ingest::{FileOutcome, IngestReport, IngestionPool};
pub use master::{CacheOutcome, MasterStore, ResolvedDataset};
pub use rules::{Eligibility, MoverRecord};
pub use scan::{MoverScanner, ScanResult};
pub use storage::{CacheLayout, CacheManifest, CacheProbe, MissReason};
pub use window::{Window, WindowAggregate};
