//! kegs-sync: encrypted keg records and chunked, resumable file transfers
//!
//! - [`keg`]: versioned records sealed with a database or override key
//! - [`transfer`]: parallel, backpressured, resumable chunk pipelines
//! - [`queue`]: bounded-parallelism task queue
//! - [`retry`]: fixed-delay retry and keyed retry de-duplication
//! - [`resume`]: persisted `DOWNLOAD:`/`UPLOAD:` descriptors
//! - [`manager`]: file-level orchestration and startup recovery

pub mod context;
pub mod keg;
pub mod manager;
pub mod memory;
pub mod queue;
pub mod remote;
pub mod resume;
pub mod retry;
pub mod stream;
pub mod transfer;

pub use context::SyncContext;
pub use keg::{Keg, KegDb, KegPayload};
pub use manager::{FileEntry, FileLookup, TransferManager};
pub use queue::TaskQueue;
pub use remote::{ChunkTransport, RemoteStore};
pub use transfer::{Downloader, ProgressFn, TransferHandle, Uploader};
