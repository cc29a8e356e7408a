//! `GPDir`: one per-interface, per-day directory of column files plus its `meta` sidecar (§3, §4.2).
//!
//! Grounded in `storage/manager.rs`'s `StorageManager` (rotation cadence, atomic metadata
//! replacement, retention-driven cleanup) generalized from the teacher's single combined
//! snapshot-per-chunk format to this crate's per-column file layout.

use super::block::{BlockMeta, ColumnMeta, DirMeta, EncodingKind, read_meta, write_meta};
use super::gpfile::GPFile;
use crate::flowkey::{Attribute, FlowCounters};
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

pub struct PersistedRow {
    pub sip: IpAddr,
    pub dip: IpAddr,
    pub dport: u16,
    pub proto: u8,
    pub counters: FlowCounters,
}

pub struct PersistedBlock {
    pub start: i64,
    pub end: i64,
    pub rows: Vec<PersistedRow>,
}

/// The decoded contents of one block, restricted to whichever columns were requested.
/// Columns not requested are `None` and never touch the key reconstructed for that row.
#[derive(Default)]
pub struct BlockColumns {
    pub num_rows: usize,
    pub sip: Option<Vec<IpAddr>>,
    pub dip: Option<Vec<IpAddr>>,
    pub dport: Option<Vec<u16>>,
    pub proto: Option<Vec<u8>>,
    pub counters: Vec<FlowCounters>,
}

fn encode_ip_column(ips: &[IpAddr]) -> Vec<u8> {
    let mut buf = Vec::new();
    for ip in ips {
        match ip {
            IpAddr::V4(v4) => {
                buf.push(4);
                buf.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                buf.push(6);
                buf.extend_from_slice(&v6.octets());
            }
        }
    }
    buf
}

fn decode_ip_column(raw: &[u8], num_rows: usize) -> io::Result<Vec<IpAddr>> {
    let mut out = Vec::with_capacity(num_rows);
    let mut pos = 0;
    for _ in 0..num_rows {
        let tag = *raw.get(pos).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "ip column: truncated tag")
        })?;
        pos += 1;
        match tag {
            4 => {
                let bytes = raw.get(pos..pos + 4).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "ip column: truncated v4")
                })?;
                out.push(IpAddr::from([bytes[0], bytes[1], bytes[2], bytes[3]]));
                pos += 4;
            }
            6 => {
                let bytes = raw.get(pos..pos + 16).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "ip column: truncated v6")
                })?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(bytes);
                out.push(IpAddr::from(octets));
                pos += 16;
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("ip column: bad tag {other}"),
                ));
            }
        }
    }
    Ok(out)
}

fn encode_dport_column(ports: &[u16]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ports.len() * 2);
    for p in ports {
        buf.extend_from_slice(&p.to_be_bytes());
    }
    buf
}

fn decode_dport_column(raw: &[u8], num_rows: usize) -> io::Result<Vec<u16>> {
    if raw.len() != num_rows * 2 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "dport column: length mismatch",
        ));
    }
    Ok(raw.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect())
}

fn encode_bytes_column(rows: &[PersistedRow]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(rows.len() * 16);
    for r in rows {
        buf.extend_from_slice(&r.counters.bytes_rcvd.to_be_bytes());
        buf.extend_from_slice(&r.counters.bytes_sent.to_be_bytes());
    }
    buf
}

fn encode_packets_column(rows: &[PersistedRow]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(rows.len() * 16);
    for r in rows {
        buf.extend_from_slice(&r.counters.packets_rcvd.to_be_bytes());
        buf.extend_from_slice(&r.counters.packets_sent.to_be_bytes());
    }
    buf
}

fn decode_counters_columns(
    bytes_raw: &[u8],
    packets_raw: &[u8],
    num_rows: usize,
) -> io::Result<Vec<FlowCounters>> {
    if bytes_raw.len() != num_rows * 16 || packets_raw.len() != num_rows * 16 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "counters column: length mismatch",
        ));
    }
    let mut out = Vec::with_capacity(num_rows);
    for i in 0..num_rows {
        let b = &bytes_raw[i * 16..i * 16 + 16];
        let p = &packets_raw[i * 16..i * 16 + 16];
        out.push(FlowCounters {
            bytes_rcvd: u64::from_be_bytes(b[0..8].try_into().unwrap()),
            bytes_sent: u64::from_be_bytes(b[8..16].try_into().unwrap()),
            packets_rcvd: u64::from_be_bytes(p[0..8].try_into().unwrap()),
            packets_sent: u64::from_be_bytes(p[8..16].try_into().unwrap()),
        });
    }
    Ok(out)
}

/// Parses a day-directory name as a strict UTC-midnight day-epoch; non-integer names are not
/// day directories (§3, §9 open question #2).
pub fn parse_day_epoch(name: &str) -> Option<i64> {
    name.parse::<i64>().ok()
}

pub struct GPDir {
    dir_path: PathBuf,
    meta_path: PathBuf,
    pub meta: DirMeta,
    files: BTreeMap<String, GPFile>,
}

impl GPDir {
    fn column_path(dir: &Path, column: &str) -> PathBuf {
        dir.join(format!("{column}.gpf"))
    }

    /// Opens (creating if absent) a day directory for appending. Validates and truncates any
    /// torn tail in each column file against the last recorded offset in `meta` (§4.2).
    pub fn open_write(root: &Path, iface: &str, day_epoch: i64) -> io::Result<Self> {
        let dir_path = root.join(iface).join(day_epoch.to_string());
        std::fs::create_dir_all(&dir_path)?;
        let meta_path = dir_path.join("meta");
        let meta = if meta_path.exists() {
            read_meta(&meta_path)?
        } else {
            DirMeta::default()
        };

        let mut files = BTreeMap::new();
        for column in super::block::COLUMN_NAMES {
            let mut f = GPFile::open_append(&Self::column_path(&dir_path, column))?;
            let valid_end = meta
                .blocks
                .last()
                .and_then(|b| b.columns.get(column))
                .map(|c| c.offset + 4 + c.compressed_len as u64)
                .unwrap_or(GPFile::HEADER_LEN);
            f.truncate_to(valid_end)?;
            files.insert(column.to_string(), f);
        }

        Ok(GPDir {
            dir_path,
            meta_path,
            meta,
            files,
        })
    }

    pub fn open_read(root: &Path, iface: &str, day_epoch: i64) -> io::Result<Self> {
        let dir_path = root.join(iface).join(day_epoch.to_string());
        let meta_path = dir_path.join("meta");
        let meta = read_meta(&meta_path)?;
        let mut files = BTreeMap::new();
        for column in super::block::COLUMN_NAMES {
            files.insert(
                column.to_string(),
                GPFile::open_append(&Self::column_path(&dir_path, column))?,
            );
        }
        Ok(GPDir {
            dir_path,
            meta_path,
            meta,
            files,
        })
    }

    pub fn dir_path(&self) -> &Path {
        &self.dir_path
    }

    /// Appends one block. Rows are re-sorted defensively by (sip, dip, dport, proto) — callers
    /// MUST NOT rely on input order (§4.2) — before column encoding.
    pub fn append(&mut self, mut block: PersistedBlock) -> io::Result<()> {
        if let Some(last) = self.meta.blocks.last() {
            if block.start <= last.start {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "block start-time is not strictly monotonic",
                ));
            }
        }
        block.rows.sort_by(|a, b| {
            (a.sip, a.dip, a.dport, a.proto).cmp(&(b.sip, b.dip, b.dport, b.proto))
        });

        let mut counters = FlowCounters::default();
        for r in &block.rows {
            counters.add(&r.counters);
        }

        let sip_raw = encode_ip_column(&block.rows.iter().map(|r| r.sip).collect::<Vec<_>>());
        let dip_raw = encode_ip_column(&block.rows.iter().map(|r| r.dip).collect::<Vec<_>>());
        let dport_raw =
            encode_dport_column(&block.rows.iter().map(|r| r.dport).collect::<Vec<_>>());
        let proto_raw: Vec<u8> = block.rows.iter().map(|r| r.proto).collect();
        let bytes_raw = encode_bytes_column(&block.rows);
        let packets_raw = encode_packets_column(&block.rows);

        let mut columns = BTreeMap::new();
        for (name, raw) in [
            ("sip", &sip_raw),
            ("dip", &dip_raw),
            ("dport", &dport_raw),
            ("proto", &proto_raw),
            ("bytes", &bytes_raw),
            ("packets", &packets_raw),
        ] {
            let file = self.files.get_mut(name).expect("all columns opened");
            let result = file.append(raw)?;
            columns.insert(
                name.to_string(),
                ColumnMeta {
                    raw_len: result.raw_len,
                    compressed_len: result.compressed_len,
                    offset: result.offset,
                    encoding: EncodingKind::Zstd,
                },
            );
        }

        self.meta.blocks.push(BlockMeta {
            start: block.start,
            end: block.end,
            num_rows: block.rows.len() as u64,
            counters,
            columns,
        });
        Ok(())
    }

    /// Writes the metadata sidecar atomically (write-tmp + rename).
    pub fn close(&self) -> io::Result<()> {
        write_meta(&self.meta_path, &self.meta)
    }

    /// Indexes of blocks whose `[start, end]` intersects `[first, last]`.
    pub fn blocks_in_range(&self, first: i64, last: i64) -> Vec<usize> {
        self.meta
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.start <= last && b.end >= first)
            .map(|(i, _)| i)
            .collect()
    }

    /// Decompresses only the columns named in `required`, plus the two counter columns (always
    /// needed for aggregation), for block `idx`.
    pub fn read_block(&mut self, idx: usize, required: &HashSet<Attribute>) -> io::Result<BlockColumns> {
        let block = self
            .meta
            .blocks
            .get(idx)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "block index out of range"))?
            .clone();
        let num_rows = block.num_rows as usize;

        let mut load = |name: &str| -> io::Result<Vec<u8>> {
            let col_meta = block
                .columns
                .get(name)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("missing column {name}")))?;
            let file = self.files.get_mut(name).expect("all columns opened");
            file.read_at(col_meta.offset, col_meta.raw_len)
        };

        let bytes_raw = load("bytes")?;
        let packets_raw = load("packets")?;
        let counters = decode_counters_columns(&bytes_raw, &packets_raw, num_rows)?;

        let sip = if required.contains(&Attribute::Sip) {
            Some(decode_ip_column(&load("sip")?, num_rows)?)
        } else {
            None
        };
        let dip = if required.contains(&Attribute::Dip) {
            Some(decode_ip_column(&load("dip")?, num_rows)?)
        } else {
            None
        };
        let dport = if required.contains(&Attribute::Dport) {
            Some(decode_dport_column(&load("dport")?, num_rows)?)
        } else {
            None
        };
        let proto = if required.contains(&Attribute::Proto) {
            Some(load("proto")?)
        } else {
            None
        };

        Ok(BlockColumns {
            num_rows,
            sip,
            dip,
            dport,
            proto,
            counters,
        })
    }
}

/// Lists the day-epoch directories under `<root>/<iface>/` whose window intersects
/// `[first, last]`. Non-integer directory names are ignored (§3, §9).
pub fn list_day_dirs(root: &Path, iface: &str, first: i64, last: i64) -> io::Result<Vec<i64>> {
    const SECS_PER_DAY: i64 = 86_400;
    let iface_dir = root.join(iface);
    if !iface_dir.exists() {
        return Ok(Vec::new());
    }
    let mut days = Vec::new();
    for entry in std::fs::read_dir(&iface_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(day) = parse_day_epoch(name) else {
            continue;
        };
        if day < last && day + SECS_PER_DAY > first {
            days.push(day);
        }
    }
    days.sort_unstable();
    Ok(days)
}

/// Admin "clean before date" (§3, §8 scenario 6): removes whole day directories strictly older
/// than `cutoff_day_epoch`. Non-conforming entries are preserved (§3: "cleanup preserves
/// non-conforming entries").
pub fn clean_before(root: &Path, iface: &str, cutoff_day_epoch: i64) -> io::Result<usize> {
    let iface_dir = root.join(iface);
    if !iface_dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in std::fs::read_dir(&iface_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(day) = parse_day_epoch(name) else {
            continue;
        };
        if day < cutoff_day_epoch {
            std::fs::remove_dir_all(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn row(a: u8, b: u8, port: u16, proto: u8, pkts: u64) -> PersistedRow {
        PersistedRow {
            sip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, a)),
            dip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, b)),
            dport: port,
            proto,
            counters: FlowCounters {
                packets_rcvd: pkts,
                ..Default::default()
            },
        }
    }

    #[test]
    fn append_then_read_full_columns() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = GPDir::open_write(dir.path(), "eth0", 1_000_000).unwrap();
        w.append(PersistedBlock {
            start: 1_000_000,
            end: 1_000_060,
            rows: vec![row(1, 2, 80, 6, 5), row(3, 4, 443, 6, 7)],
        })
        .unwrap();
        w.close().unwrap();

        let mut r = GPDir::open_read(dir.path(), "eth0", 1_000_000).unwrap();
        assert_eq!(r.meta.blocks.len(), 1);
        let required: HashSet<Attribute> = [Attribute::Sip, Attribute::Dip, Attribute::Dport, Attribute::Proto]
            .into_iter()
            .collect();
        let cols = r.read_block(0, &required).unwrap();
        assert_eq!(cols.num_rows, 2);
        assert_eq!(cols.sip.unwrap().len(), 2);
        assert_eq!(cols.counters[0].packets_rcvd + cols.counters[1].packets_rcvd, 12);
    }

    #[test]
    fn monotonic_start_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = GPDir::open_write(dir.path(), "eth0", 1_000_000).unwrap();
        w.append(PersistedBlock {
            start: 2000,
            end: 2060,
            rows: vec![row(1, 2, 80, 6, 1)],
        })
        .unwrap();
        let err = w
            .append(PersistedBlock {
                start: 2000,
                end: 2060,
                rows: vec![row(1, 2, 80, 6, 1)],
            })
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn unrequested_columns_are_not_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = GPDir::open_write(dir.path(), "eth0", 1_000_000).unwrap();
        w.append(PersistedBlock {
            start: 1,
            end: 2,
            rows: vec![row(1, 2, 80, 6, 1)],
        })
        .unwrap();
        w.close().unwrap();

        let mut r = GPDir::open_read(dir.path(), "eth0", 1_000_000).unwrap();
        let required: HashSet<Attribute> = [Attribute::Dport].into_iter().collect();
        let cols = r.read_block(0, &required).unwrap();
        assert!(cols.sip.is_none());
        assert!(cols.dip.is_none());
        assert!(cols.proto.is_none());
        assert!(cols.dport.is_some());
    }

    #[test]
    fn list_day_dirs_ignores_non_integer_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("eth0").join("172800")).unwrap();
        std::fs::create_dir_all(dir.path().join("eth0").join("not-a-day")).unwrap();
        let days = list_day_dirs(dir.path(), "eth0", 0, 1_000_000).unwrap();
        assert_eq!(days, vec![172_800]);
    }

    #[test]
    fn clean_before_removes_only_older_days_and_preserves_junk() {
        let dir = tempfile::tempdir().unwrap();
        for day in [0i64, 86_400, 172_800] {
            std::fs::create_dir_all(dir.path().join("eth0").join(day.to_string())).unwrap();
        }
        std::fs::create_dir_all(dir.path().join("eth0").join("garbage")).unwrap();
        let removed = clean_before(dir.path(), "eth0", 172_800).unwrap();
        assert_eq!(removed, 2);
        assert!(dir.path().join("eth0").join("172800").exists());
        assert!(dir.path().join("eth0").join("garbage").exists());
        assert!(!dir.path().join("eth0").join("0").exists());
    }
}
