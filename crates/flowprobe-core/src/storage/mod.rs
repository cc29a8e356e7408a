//! The column-partitioned, time-bucketed storage engine ("goDB", §4.2).

pub mod block;
pub mod gpdir;
pub mod gpfile;
pub mod hostid;

pub use block::{BlockMeta, ColumnMeta, DirMeta, EncodingKind, COLUMN_NAMES};
pub use gpdir::{clean_before, list_day_dirs, parse_day_epoch, BlockColumns, GPDir, PersistedBlock, PersistedRow};
pub use gpfile::GPFile;
pub use hostid::host_id;
