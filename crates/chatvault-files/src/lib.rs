//! Attachment storage: content-addressed acquisition of message files into
//! a dated directory tree, with hard-link deduplication and orphan sweeps.

pub mod cleanup;
pub mod download;
pub mod error;
pub mod pipeline;
pub mod storage;

pub use cleanup::{SweepReport, sweep_orphans};
pub use download::{Downloaded, Downloader, sha256_hex};
pub use error::DownloadError;
pub use pipeline::{FileOutcome, FilePipeline, FileStats};
pub use storage::{Category, DiskSpace, LinkKind, Storage, SystemDiskSpace};
