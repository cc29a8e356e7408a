//! `GPFile`: one append-only column file, `<magic><version>` followed by a concatenation of
//! length-prefixed compressed frames (§6: "column files are `<magic><version><(len,
//! compressed-bytes)*>` sequences").
//!
//! Grounded in the teacher's `storage/chunk.rs` write-path (`zstd::encode_all` per frame, a
//! fixed magic+version header validated on open) adapted from one combined chunk file to this
//! crate's one-file-per-column layout; atomic tmp+rename is kept at the directory-metadata level
//! rather than per-column-file, since a column file is append-only and never rewritten once a
//! frame lands — only the sidecar `meta` needs atomic replacement. Each frame is self-describing
//! (`u32` compressed length prefix) so a torn tail left by a crash between writing the frame and
//! updating `meta` can be detected and truncated on next open, per §4.2: "trailing bytes in
//! column files are truncated on the next open after validating the last recorded offset."

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

const MAGIC: [u8; 4] = *b"GPF1";
const VERSION: u16 = 1;

pub struct GPFile {
    file: File,
}

pub struct AppendResult {
    pub offset: u64,
    pub compressed_len: u32,
    pub raw_len: u32,
}

impl GPFile {
    /// Length of the file-level `<magic><version>` header; frame offsets never fall below this.
    pub const HEADER_LEN: u64 = MAGIC.len() as u64 + 2;

    pub fn open_append(path: &Path) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        if file.metadata()?.len() == 0 {
            file.write_all(&MAGIC)?;
            file.write_all(&VERSION.to_le_bytes())?;
            file.sync_all()?;
        } else {
            Self::validate_header(&mut file)?;
        }
        Ok(GPFile { file })
    }

    fn validate_header(file: &mut File) -> io::Result<()> {
        file.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; Self::HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        if header[0..4] != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad column file magic: expected {MAGIC:?}, got {:?}", &header[0..4]),
            ));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported column file version: {version}"),
            ));
        }
        file.seek(SeekFrom::End(0))?;
        Ok(())
    }

    /// Compresses `raw` and appends `[u32 compressed_len][compressed bytes]` to the file,
    /// returning the offset the frame started at (the value recorded in `BlockMeta`).
    pub fn append(&mut self, raw: &[u8]) -> io::Result<AppendResult> {
        let offset = self.file.metadata()?.len();
        let compressed = zstd::encode_all(raw, 3)?;
        let compressed_len = compressed.len() as u32;
        self.file.write_all(&compressed_len.to_le_bytes())?;
        self.file.write_all(&compressed)?;
        self.file.sync_all()?;
        Ok(AppendResult {
            offset,
            compressed_len,
            raw_len: raw.len() as u32,
        })
    }

    /// Reads and decompresses the frame starting at `offset`, verifying the decompressed size
    /// matches `expected_raw_len` (§4.2: "mismatch ⇒ block is marked corrupted").
    pub fn read_at(&mut self, offset: u64, expected_raw_len: u32) -> io::Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut len_buf = [0u8; 4];
        self.file.read_exact(&mut len_buf)?;
        let compressed_len = u32::from_le_bytes(len_buf) as usize;
        let mut compressed = vec![0u8; compressed_len];
        self.file.read_exact(&mut compressed)?;
        let raw = zstd::decode_all(compressed.as_slice())?;
        if raw.len() as u32 != expected_raw_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "column frame at offset {offset}: expected {expected_raw_len} raw bytes, got {}",
                    raw.len()
                ),
            ));
        }
        Ok(raw)
    }

    /// Truncates the file to `valid_end`, discarding any torn tail beyond the last block
    /// recorded in `meta` (called once on open-in-write, before the first new append).
    pub fn truncate_to(&mut self, valid_end: u64) -> io::Result<()> {
        let valid_end = valid_end.max(Self::HEADER_LEN);
        let actual_len = self.file.metadata()?.len();
        if actual_len > valid_end {
            self.file.set_len(valid_end)?;
        }
        Ok(())
    }

    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sip.gpf");
        let mut f = GPFile::open_append(&path).unwrap();
        let a = f.append(b"hello world").unwrap();
        let b = f.append(b"second frame, longer content here").unwrap();
        assert_eq!(a.offset, GPFile::HEADER_LEN);
        assert!(b.offset > a.offset);

        let mut reader = GPFile::open_append(&path).unwrap();
        assert_eq!(reader.read_at(a.offset, a.raw_len).unwrap(), b"hello world");
        assert_eq!(
            reader.read_at(b.offset, b.raw_len).unwrap(),
            b"second frame, longer content here"
        );
    }

    #[test]
    fn detects_raw_len_mismatch_as_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sip.gpf");
        let mut f = GPFile::open_append(&path).unwrap();
        let res = f.append(b"abc").unwrap();
        assert!(f.read_at(res.offset, 999).is_err());
    }

    #[test]
    fn truncates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sip.gpf");
        let mut f = GPFile::open_append(&path).unwrap();
        let a = f.append(b"good frame").unwrap();
        let valid_end = a.offset + 4 + a.compressed_len as u64;
        // simulate a torn write: extra garbage appended after the last recorded frame
        {
            let mut raw = OpenOptions::new().append(true).open(&path).unwrap();
            raw.write_all(b"garbage-tail-bytes").unwrap();
        }
        assert!(f.len().unwrap() > valid_end);
        f.truncate_to(valid_end).unwrap();
        assert_eq!(f.len().unwrap(), valid_end);
        assert_eq!(f.read_at(a.offset, a.raw_len).unwrap(), b"good frame");
    }

    #[test]
    fn rejects_bad_magic_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sip.gpf");
        std::fs::write(&path, b"NOPE\x01\x00garbage").unwrap();
        assert!(GPFile::open_append(&path).is_err());
    }

    #[test]
    fn new_file_starts_with_magic_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sip.gpf");
        let mut f = GPFile::open_append(&path).unwrap();
        f.append(b"x").unwrap();
        drop(f);

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[0..4], &MAGIC);
        assert_eq!(u16::from_le_bytes([raw[4], raw[5]]), VERSION);
    }
}
