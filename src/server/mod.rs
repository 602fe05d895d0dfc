//! Authoritative side: the host world and snapshot scheduling

pub mod host;
pub mod snapshot;

pub use host::AuthorityHost;
pub use snapshot::{SnapshotBuilder, SnapshotStats};
