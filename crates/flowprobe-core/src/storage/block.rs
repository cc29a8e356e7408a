//! The per-directory metadata sidecar format (§3, §4.2 expansion in SPEC_FULL.md).
//!
//! `meta` is a `bincode`-serialized record wrapped in a single whole-file zstd frame, fronted by
//! a fixed magic/version header — the same recipe the teacher's `storage/chunk_v2.rs` uses for
//! its per-chunk header, applied here to the directory-level sidecar instead of an in-file index.

use crate::flowkey::FlowCounters;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

const MAGIC: [u8; 4] = *b"GPDM";
const VERSION: u16 = 1;

pub const COLUMN_NAMES: [&str; 6] = ["sip", "dip", "dport", "proto", "bytes", "packets"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncodingKind {
    Zstd,
    Raw,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub raw_len: u32,
    pub compressed_len: u32,
    pub offset: u64,
    pub encoding: EncodingKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockMeta {
    pub start: i64,
    pub end: i64,
    pub num_rows: u64,
    pub counters: FlowCounters,
    pub columns: std::collections::BTreeMap<String, ColumnMeta>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DirMeta {
    pub blocks: Vec<BlockMeta>,
}

impl DirMeta {
    /// §8 universal invariant: `sum(block.counters for block in d) == d.counters`.
    pub fn aggregate_counters(&self) -> FlowCounters {
        let mut total = FlowCounters::default();
        for block in &self.blocks {
            total.add(&block.counters);
        }
        total
    }

    /// §3 invariant: per interface, block start-times are strictly monotonic.
    pub fn is_monotonic(&self) -> bool {
        self.blocks.windows(2).all(|w| w[0].start < w[1].start)
    }
}

pub fn write_meta(path: &Path, meta: &DirMeta) -> io::Result<()> {
    let payload = bincode::serialize(meta)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let compressed = zstd::encode_all(payload.as_slice(), 3)?;

    let tmp_path = path.with_extension("tmp");
    {
        use std::io::Write;
        let mut f = std::fs::File::create(&tmp_path)?;
        f.write_all(&MAGIC)?;
        f.write_all(&VERSION.to_le_bytes())?;
        f.write_all(&compressed)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

pub fn read_meta(path: &Path) -> io::Result<DirMeta> {
    let data = std::fs::read(path)?;
    if data.len() < 6 || data[0..4] != MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "meta: bad magic",
        ));
    }
    let version = u16::from_le_bytes([data[4], data[5]]);
    if version != VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("meta: unsupported version {version}"),
        ));
    }
    let decompressed = zstd::decode_all(&data[6..])?;
    bincode::deserialize(&decompressed)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn roundtrip_meta() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta");
        let mut meta = DirMeta::default();
        meta.blocks.push(BlockMeta {
            start: 100,
            end: 200,
            num_rows: 3,
            counters: FlowCounters {
                bytes_rcvd: 10,
                ..Default::default()
            },
            columns: BTreeMap::new(),
        });
        write_meta(&path, &meta).unwrap();
        let loaded = read_meta(&path).unwrap();
        assert_eq!(loaded.blocks.len(), 1);
        assert_eq!(loaded.blocks[0].start, 100);
        assert_eq!(loaded.aggregate_counters().bytes_rcvd, 10);
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta");
        std::fs::write(&path, b"bogus-content").unwrap();
        assert!(read_meta(&path).is_err());
    }

    #[test]
    fn monotonic_check() {
        let mut meta = DirMeta::default();
        let mk = |start: i64| BlockMeta {
            start,
            end: start + 1,
            num_rows: 0,
            counters: FlowCounters::default(),
            columns: BTreeMap::new(),
        };
        meta.blocks.push(mk(10));
        meta.blocks.push(mk(20));
        assert!(meta.is_monotonic());
        meta.blocks.push(mk(15));
        assert!(!meta.is_monotonic());
    }
}
