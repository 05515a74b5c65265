//! Content delivery for a paginated image reader.
//!
//! [`Reader`] is the entry point. It streams directory listings in
//! cancellable batches ([`scan`], [`session`]), serves page bytes from
//! directories and archives ([`container`]) through a distance-aware cache
//! ([`page_cache`]), reads ahead of the viewer ([`prefetch`]) and extracts
//! solid archives in the background ([`solid`]). Progress is pushed to
//! subscribers as [`ReaderEvent`]s.

pub mod container;
pub mod error;
pub mod events;
pub mod page_cache;
pub mod prefetch;
pub mod scan;
pub mod service;
pub mod session;
pub mod solid;

pub use crate::container::{Container, ContainerKind};
pub use crate::events::{EventBus, ReaderEvent};
pub use crate::page_cache::{CacheStats, Direction, PageCache, PageKey};
pub use crate::prefetch::{PrefetchStats, Prefetcher};
pub use crate::scan::{DirectoryScanner, ScanEvent, ScanOptions, ScanSummary};
pub use crate::service::{PageRequest, Reader};
pub use crate::session::{SessionId, SessionKind, StreamManager};
pub use crate::solid::{ExtractionProgress, ExtractionStatus, SolidArchiveExtractor};
