//! Save state files for the ATmega328P core.
//!
//! A save state is a [`Snapshot`] serialized with bincode and deflate
//! compressed.
//!
//! ## File format
//!
//! ```text
//! +------------------+
//! | Magic "A328"     |  4 bytes
//! +------------------+
//! | Format version   |  u32 little-endian (currently 1)
//! +------------------+
//! | Device byte      |  u8 (0x0F, last ATmega328P signature byte)
//! +------------------+
//! | Compressed data  |  deflate-compressed bincode payload
//! +------------------+
//! ```

use std::path::Path;

use crate::error::{Error, Result};
use crate::snapshot::Snapshot;
use crate::{DATA_SIZE, FLASH_SIZE};

/// Magic bytes identifying a save state file.
const MAGIC: &[u8; 4] = b"A328";
/// Current save state format version.
const FORMAT_VERSION: u32 = 1;
/// ATmega328P signature byte 3 (1E 95 0F).
const DEVICE_ID: u8 = 0x0F;
const HEADER_LEN: usize = 9;

/// Serialize and compress a snapshot, header included.
pub fn encode(state: &Snapshot) -> Result<Vec<u8>> {
    let payload = bincode::serialize(state)?;
    let compressed = miniz_oxide::deflate::compress_to_vec(&payload, 6);

    let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.push(DEVICE_ID);
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Verify the header, decompress and deserialize.
pub fn decode(bytes: &[u8]) -> Result<Snapshot> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::InvalidSaveState("file too small".into()));
    }
    if &bytes[0..4] != MAGIC {
        return Err(Error::InvalidSaveState("bad magic".into()));
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != FORMAT_VERSION {
        return Err(Error::InvalidSaveState(format!(
            "unsupported version {} (expected {})",
            version, FORMAT_VERSION
        )));
    }
    if bytes[8] != DEVICE_ID {
        return Err(Error::InvalidSaveState(format!("device 0x{:02X} is not an ATmega328P", bytes[8])));
    }

    let decompressed = miniz_oxide::inflate::decompress_to_vec(&bytes[HEADER_LEN..])
        .map_err(|e| Error::InvalidSaveState(format!("decompress error: {:?}", e)))?;
    let state: Snapshot = bincode::deserialize(&decompressed)?;

    if state.data.len() != DATA_SIZE || state.program.len() != FLASH_SIZE {
        return Err(Error::InvalidSaveState(format!(
            "memory sizes {}/{} do not match the device",
            state.data.len(),
            state.program.len()
        )));
    }
    Ok(state)
}

/// Save state to file with header and deflate compression.
pub fn save_to_file(state: &Snapshot, path: &Path) -> Result<()> {
    let out = encode(state)?;
    std::fs::write(path, out)?;
    log::info!("saved state to {}", path.display());
    Ok(())
}

/// Load state from file, verifying magic, version and device.
pub fn load_from_file(path: &Path) -> Result<Snapshot> {
    let bytes = std::fs::read(path)?;
    decode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Atmega328p;

    fn sample() -> Snapshot {
        let mut a = Atmega328p::new().unwrap();
        a.load_program(&[0x0F, 0xEF, 0x98, 0x95]).unwrap(); // LDI R16, 0xFF; BREAK
        a.run_until_stopped();
        a.snapshot()
    }

    #[test]
    fn test_encode_decode() {
        let snap = sample();
        let bytes = encode(&snap).unwrap();
        assert_eq!(&bytes[0..4], b"A328");
        // Mostly-empty memories compress well
        assert!(bytes.len() < (DATA_SIZE + FLASH_SIZE) / 4);
        assert_eq!(decode(&bytes).unwrap(), snap);
    }

    #[test]
    fn test_rejects_bad_header() {
        let mut bytes = encode(&sample()).unwrap();
        assert!(matches!(decode(&bytes[..5]), Err(Error::InvalidSaveState(_))));
        bytes[8] = 0x02;
        assert!(matches!(decode(&bytes), Err(Error::InvalidSaveState(_))));
        bytes[0] = b'X';
        assert!(matches!(decode(&bytes), Err(Error::InvalidSaveState(_))));
    }

    #[test]
    fn test_file_round_trip_restores_core() {
        let snap = sample();
        let path = std::env::temp_dir().join(format!("atmega328p-core-{}.state", std::process::id()));
        save_to_file(&snap, &path).unwrap();
        let loaded = load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let mut b = Atmega328p::new().unwrap();
        b.restore(&loaded).unwrap();
        assert_eq!(b.mem.reg(16), 0xFF);
        assert!(b.cpu.stopped);
        assert_eq!(b.snapshot(), snap);
    }
}
