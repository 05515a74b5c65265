mod snapshot;

pub use self::snapshot::DirectorySnapshot;
pub(crate) use self::snapshot::{EntryRow, SnapshotRow, from_nanos, to_nanos};
