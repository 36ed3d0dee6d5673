pub mod error;
pub mod record;
pub mod blob;
pub mod header;
pub mod block;
pub mod extent;
pub mod reorder;
pub mod io_stream;
pub mod conf;
pub mod archive;

pub use error::{Error, Result};
pub use header::{ArchiveHeader, DeviceInfo, ConfigEntry, CANONICAL_UUID};
pub use block::{BlockGroup, BlockInfo, CLUSTER_SIZE, BLOCK_SIZE};
pub use extent::{Extent, ExtentHeader};
pub use io_stream::{ArchiveReader, ArchiveWriter, ClusterReader, StreamStats};
pub use reorder::{Reorder, ReorderConfig};
pub use archive::{Archive, PackOptions, OptimizeOutcome};
