//! The per-host identifier persisted at `<db-root>/host.id` (§3 expansion).
//!
//! Linux hosts prefer `/etc/machine-id`; everything else (dev machines, CI, macOS) falls back
//! to a once-generated random ID cached in the db-root, mirroring how the rest of this store
//! treats `<db-root>` as the single source of durable host-local state.

use rand::RngCore;
use std::io;
use std::path::Path;

const MACHINE_ID_PATH: &str = "/etc/machine-id";

pub fn host_id(db_root: &Path) -> io::Result<String> {
    if let Ok(id) = std::fs::read_to_string(MACHINE_ID_PATH) {
        let trimmed = id.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    let host_id_path = db_root.join("host.id");
    if let Ok(existing) = std::fs::read_to_string(&host_id_path) {
        let trimmed = existing.trim();
        if trimmed.len() == 32 {
            return Ok(trimmed.to_string());
        }
    }

    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let id: String = bytes.iter().map(|b| format!("{b:02x}")).collect();

    std::fs::create_dir_all(db_root)?;
    let tmp = host_id_path.with_extension("tmp");
    std::fs::write(&tmp, &id)?;
    std::fs::rename(&tmp, &host_id_path)?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_persists_once() {
        let dir = tempfile::tempdir().unwrap();
        let first = host_id(dir.path()).unwrap();
        assert_eq!(first.len(), 32);
        let second = host_id(dir.path()).unwrap();
        assert_eq!(first, second);
    }
}
