//! Isolated storage: directory trees, routing tables, usage and archives.

pub mod archive;
pub mod error;
pub mod layout;
pub mod redirect;
pub mod usage;

pub use archive::{ArchiveConfig, ArchiveHandle, ArchiveManifest, ArchiveService};
pub use error::{ArchiveError, StorageError, StorageResult};
pub use layout::{LAYOUT_VERSION, StorageCategory, StorageLayout};
pub use redirect::{Redirect, RedirectionTable};
pub use usage::{CategoryUsage, UsageReport, WalkBudget};
