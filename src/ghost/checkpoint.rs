//! Ghost cache checkpointing
//!
//! Layout: a 4-byte ASCII magic `"hare"`, a 4-byte hash of that same string
//! computed by the ghost hash family, then `(key_hash: u32, kv_size: u32)`
//! pairs in LRU-to-MRU order. Replaying the body in file order rebuilds the
//! exact recency ordering. The header hash ties a file to the hash family
//! that produced it; a mismatch fails the load.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use super::{ghost_hash, AccessMode, SampledGhostCache};
use crate::error::CheckpointError;

const MAGIC: &[u8; 4] = b"hare";

/// Write the scaffold's `(key_hash, kv_size)` sequence to `path`.
///
/// Best-effort: no temp-file rename and no fsync, since a torn checkpoint
/// only costs warm-up accuracy and is rejected at load.
pub fn save(ghost: &SampledGhostCache, path: &Path) -> Result<(), CheckpointError> {
    let mut f = BufWriter::new(File::create(path)?);
    f.write_all(MAGIC)?;
    f.write_all(&ghost_hash(MAGIC).to_le_bytes())?;

    let mut io_err = None;
    ghost.for_each_lru(|key_hash, kv_size| {
        if io_err.is_some() {
            return;
        }
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&key_hash.to_le_bytes());
        buf[4..].copy_from_slice(&kv_size.to_le_bytes());
        if let Err(e) = f.write_all(&buf) {
            io_err = Some(e);
        }
    });
    if let Some(e) = io_err {
        return Err(e.into());
    }
    f.flush()?;
    Ok(())
}

/// Replay a checkpoint into `ghost`. Header validation failures are fatal
/// for the load; the scaffold keeps whatever it already held.
pub fn load(ghost: &mut SampledGhostCache, path: &Path) -> Result<(), CheckpointError> {
    let mut f = BufReader::new(File::open(path)?);

    let mut header = [0u8; 4];
    f.read_exact(&mut header)?;
    if &header != MAGIC {
        return Err(CheckpointError::Incompatible);
    }
    let mut hash_buf = [0u8; 4];
    f.read_exact(&mut hash_buf)?;
    if u32::from_le_bytes(hash_buf) != ghost_hash(MAGIC) {
        return Err(CheckpointError::Incompatible);
    }

    let mut buf = [0u8; 8];
    loop {
        match f.read_exact(&mut buf) {
            Ok(()) => {
                let key_hash = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
                let kv_size = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
                ghost.access_hashed(key_hash, kv_size, AccessMode::Noop);
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
