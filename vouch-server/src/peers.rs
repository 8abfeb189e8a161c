//! Peer-address blob persistence.
//!
//! The peer list itself is opaque to the store; it is written as
//! `magic(4) ‖ payload ‖ SHA-256(magic ‖ payload)` via a random-suffix
//! temp file renamed into place, so a crash mid-write never leaves a
//! half-written file behind. Reads verify length, magic, and checksum.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use vouch_sdk::canonical::sha256;

/// File-format magic for the peers blob.
const PEERS_MAGIC: [u8; 4] = *b"VCHP";
const PEERS_FILE: &str = "peers.dat";

#[derive(Debug, thiserror::Error)]
pub enum PeersError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peers file is truncated")]
    Truncated,

    #[error("peers file magic mismatch")]
    BadMagic,

    #[error("peers file checksum mismatch")]
    ChecksumMismatch,
}

fn peers_path(data_dir: &Path) -> PathBuf {
    data_dir.join(PEERS_FILE)
}

/// Atomically persist the peer-address payload under `data_dir`.
pub fn write(data_dir: &Path, payload: &[u8]) -> Result<(), PeersError> {
    let mut framed = Vec::with_capacity(4 + payload.len() + 32);
    framed.extend_from_slice(&PEERS_MAGIC);
    framed.extend_from_slice(payload);
    let checksum = sha256(&framed);
    framed.extend_from_slice(&checksum);

    let tmp = data_dir.join(format!("{PEERS_FILE}.{:04x}", rand::random::<u16>()));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&framed)?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, peers_path(data_dir)) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Read and verify the peer-address payload under `data_dir`.
pub fn read(data_dir: &Path) -> Result<Vec<u8>, PeersError> {
    let bytes = fs::read(peers_path(data_dir))?;
    if bytes.len() < PEERS_MAGIC.len() + 32 {
        return Err(PeersError::Truncated);
    }
    let (framed, stored_checksum) = bytes.split_at(bytes.len() - 32);
    if sha256(framed)[..] != stored_checksum[..] {
        return Err(PeersError::ChecksumMismatch);
    }
    if framed[..PEERS_MAGIC.len()] != PEERS_MAGIC[..] {
        return Err(PeersError::BadMagic);
    }
    Ok(framed[PEERS_MAGIC.len()..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let payload = b"10.0.0.1:4944\n10.0.0.2:4944\n";
        write(dir.path(), payload).unwrap();
        assert_eq!(read(dir.path()).unwrap(), payload);

        // overwrite with new content
        write(dir.path(), b"").unwrap();
        assert_eq!(read(dir.path()).unwrap(), b"");
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), b"peer data").unwrap();

        let path = dir.path().join(PEERS_FILE);
        let mut bytes = fs::read(&path).unwrap();
        bytes[5] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            read(dir.path()),
            Err(PeersError::ChecksumMismatch)
        ));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        // a well-formed frame with the wrong magic
        let mut framed = Vec::new();
        framed.extend_from_slice(b"NOPE");
        framed.extend_from_slice(b"payload");
        let checksum = sha256(&framed);
        framed.extend_from_slice(&checksum);
        fs::write(dir.path().join(PEERS_FILE), &framed).unwrap();

        assert!(matches!(read(dir.path()), Err(PeersError::BadMagic)));
    }

    #[test]
    fn short_file_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(PEERS_FILE), b"tiny").unwrap();
        assert!(matches!(read(dir.path()), Err(PeersError::Truncated)));
    }
}
