//! # Spill Topend
//!
//! The topend is the persistence collaborator behind the block cache: it
//! stores evicted block payloads and hands them back on fetch. The cache
//! is the only caller.
//!
//! ## Spill File Format
//!
//! One file per block, `{spill_dir}/{block_id}.block`:
//!
//! ```text
//! SpillFile := [BlockImageHeader (64 bytes)] [payload (BLOCK_SIZE bytes)]
//! ```
//!
//! The header carries everything needed to validate and re-adopt the
//! payload: magic, version, block id, schema fingerprint, payload crc32,
//! active tuple count, both insertion offsets, and the base address the
//! buffer had when it was released (`set_data` relocates string refs by
//! the delta to the reload address).
//!
//! The payload itself is the block's storage verbatim: the bidirectional
//! layout makes the whole block a self-contained unit, so no per-tuple
//! serialization happens on either path.
//!
//! ## I/O Strategy
//!
//! Writes are buffered and fsynced; reads go through mmap and are copied
//! once into the block's fresh buffer. Spill files are removed when their
//! block is destroyed, and best-effort on drop.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISO_HDLC};
use eyre::{ensure, Result, WrapErr};
use hashbrown::HashSet;
use memmap2::Mmap;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::block::BlockId;
use crate::config::{BLOCK_SIZE, SPILL_HEADER_SIZE};

const MAGIC: [u8; 4] = *b"SBLK";
const VERSION: u16 = 1;

const PAYLOAD_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn payload_checksum(payload: &[u8]) -> u32 {
    PAYLOAD_CRC.checksum(payload)
}

/// Metadata persisted in front of every spilled block payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct BlockImageHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub _pad: u16,
    pub block_id: u64,
    pub schema_fingerprint: u32,
    pub payload_crc: u32,
    pub active_tuple_count: u64,
    pub tuple_insertion_offset: u64,
    pub non_inlined_insertion_offset: u64,
    pub orig_base: u64,
    pub _reserved: [u8; 8],
}

const _: () = assert!(
    std::mem::size_of::<BlockImageHeader>() == SPILL_HEADER_SIZE,
    "BlockImageHeader must match SPILL_HEADER_SIZE"
);

impl BlockImageHeader {
    pub fn new(
        block_id: BlockId,
        schema_fingerprint: u32,
        active_tuple_count: usize,
        tuple_insertion_offset: usize,
        non_inlined_insertion_offset: usize,
        orig_base: usize,
        payload_crc: u32,
    ) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            _pad: 0,
            block_id: block_id.0,
            schema_fingerprint,
            payload_crc,
            active_tuple_count: active_tuple_count as u64,
            tuple_insertion_offset: tuple_insertion_offset as u64,
            non_inlined_insertion_offset: non_inlined_insertion_offset as u64,
            orig_base: orig_base as u64,
            _reserved: [0; 8],
        }
    }

    fn validate(&self, expected: BlockId) -> Result<()> {
        ensure!(self.magic == MAGIC, "bad spill file magic: {:02x?}", self.magic);
        ensure!(
            self.version == VERSION,
            "unsupported spill file version: {}",
            self.version
        );
        ensure!(
            self.block_id == expected.0,
            "spill file holds block {}, expected {}",
            self.block_id,
            expected
        );
        Ok(())
    }
}

/// Persistence interface the block cache evicts through.
pub trait Topend {
    /// Persist a full block payload. Overwrites any previous image of the
    /// same block.
    fn store_block(&mut self, header: &BlockImageHeader, payload: &[u8]) -> Result<()>;

    /// Read a previously stored block image back, verbatim.
    fn load_block(&mut self, id: BlockId) -> Result<(BlockImageHeader, Box<[u8]>)>;

    /// Drop the stored image of a destroyed block. A block that was never
    /// stored is not an error.
    fn remove_block(&mut self, id: BlockId) -> Result<()>;
}

/// File-per-block topend writing into a spill directory.
pub struct FileTopend {
    spill_dir: PathBuf,
    dir_created: bool,
    written: HashSet<u64>,
}

impl FileTopend {
    pub fn new(spill_dir: impl Into<PathBuf>) -> Self {
        Self {
            spill_dir: spill_dir.into(),
            dir_created: false,
            written: HashSet::new(),
        }
    }

    fn block_path(&self, id: BlockId) -> PathBuf {
        self.spill_dir.join(format!("{}.block", id.0))
    }

    fn ensure_spill_dir(&mut self) -> Result<()> {
        if !self.dir_created {
            fs::create_dir_all(&self.spill_dir).wrap_err_with(|| {
                format!("failed to create spill directory: {:?}", self.spill_dir)
            })?;
            self.dir_created = true;
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        for id in self.written.drain() {
            let _ = fs::remove_file(self.spill_dir.join(format!("{id}.block")));
        }
        if self.dir_created {
            let _ = fs::remove_dir(&self.spill_dir);
        }
    }

    pub fn spill_dir(&self) -> &Path {
        &self.spill_dir
    }
}

impl Topend for FileTopend {
    fn store_block(&mut self, header: &BlockImageHeader, payload: &[u8]) -> Result<()> {
        ensure!(
            payload.len() == BLOCK_SIZE,
            "block payload is {} bytes, expected {}",
            payload.len(),
            BLOCK_SIZE
        );
        self.ensure_spill_dir()?;

        let path = self.block_path(BlockId(header.block_id));
        let file = File::create(&path)
            .wrap_err_with(|| format!("failed to create spill file: {path:?}"))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(header.as_bytes())?;
        writer.write_all(payload)?;
        writer.flush()?;
        writer.into_inner()?.sync_all()?;

        self.written.insert(header.block_id);
        tracing::debug!(block_id = header.block_id, "stored block image");
        Ok(())
    }

    fn load_block(&mut self, id: BlockId) -> Result<(BlockImageHeader, Box<[u8]>)> {
        let path = self.block_path(id);
        let file =
            File::open(&path).wrap_err_with(|| format!("failed to open spill file: {path:?}"))?;
        // SAFETY: the spill file is owned by this process and not written
        // concurrently; the mapping is dropped before this call returns.
        let mmap = unsafe { Mmap::map(&file) }.wrap_err("failed to mmap spill file")?;

        ensure!(
            mmap.len() == SPILL_HEADER_SIZE + BLOCK_SIZE,
            "spill file {path:?} is {} bytes, expected {}",
            mmap.len(),
            SPILL_HEADER_SIZE + BLOCK_SIZE
        );

        let header = BlockImageHeader::read_from_bytes(&mmap[..SPILL_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read spill header: {e:?}"))?;
        header.validate(id)?;

        let payload: Box<[u8]> = mmap[SPILL_HEADER_SIZE..].to_vec().into_boxed_slice();
        let crc = payload_checksum(&payload);
        ensure!(
            crc == header.payload_crc,
            "block {} payload checksum mismatch: {:08x} != {:08x}",
            id,
            crc,
            header.payload_crc
        );

        tracing::debug!(block_id = id.0, "loaded block image");
        Ok((header, payload))
    }

    fn remove_block(&mut self, id: BlockId) -> Result<()> {
        if self.written.remove(&id.0) {
            let path = self.block_path(id);
            fs::remove_file(&path)
                .wrap_err_with(|| format!("failed to remove spill file: {path:?}"))?;
        }
        Ok(())
    }
}

impl Drop for FileTopend {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_header(id: u64, payload: &[u8]) -> BlockImageHeader {
        BlockImageHeader::new(
            BlockId(id),
            0xDEAD_BEEF,
            3,
            66,
            BLOCK_SIZE - 128,
            0x7000_0000,
            payload_checksum(payload),
        )
    }

    #[test]
    fn store_load_roundtrip() {
        let dir = tempdir().unwrap();
        let mut topend = FileTopend::new(dir.path().join("spill"));

        let mut payload = vec![0u8; BLOCK_SIZE];
        payload[0] = 0xAB;
        payload[BLOCK_SIZE - 1] = 0xCD;
        let header = sample_header(7, &payload);

        topend.store_block(&header, &payload).unwrap();
        let (loaded, bytes) = topend.load_block(BlockId(7)).unwrap();

        assert_eq!(loaded.block_id, 7);
        assert_eq!(loaded.active_tuple_count, 3);
        assert_eq!(loaded.orig_base, 0x7000_0000);
        assert_eq!(bytes[0], 0xAB);
        assert_eq!(bytes[BLOCK_SIZE - 1], 0xCD);
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let dir = tempdir().unwrap();
        let spill = dir.path().join("spill");
        let mut topend = FileTopend::new(spill.clone());

        let payload = vec![0x11u8; BLOCK_SIZE];
        let header = sample_header(1, &payload);
        topend.store_block(&header, &payload).unwrap();

        // Flip one payload byte on disk.
        let path = spill.join("1.block");
        let mut bytes = fs::read(&path).unwrap();
        bytes[SPILL_HEADER_SIZE + 100] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let err = topend.load_block(BlockId(1)).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn wrong_id_is_rejected() {
        let dir = tempdir().unwrap();
        let spill = dir.path().join("spill");
        let mut topend = FileTopend::new(spill.clone());

        let payload = vec![0u8; BLOCK_SIZE];
        let header = sample_header(2, &payload);
        topend.store_block(&header, &payload).unwrap();

        // Masquerade block 2's file as block 9's.
        fs::rename(spill.join("2.block"), spill.join("9.block")).unwrap();
        topend.written.insert(9);

        let err = topend.load_block(BlockId(9)).unwrap_err();
        assert!(err.to_string().contains("expected 9"));
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut topend = FileTopend::new(dir.path().join("spill"));

        let payload = vec![0u8; BLOCK_SIZE];
        let header = sample_header(4, &payload);
        topend.store_block(&header, &payload).unwrap();

        topend.remove_block(BlockId(4)).unwrap();
        topend.remove_block(BlockId(4)).unwrap();
        assert!(topend.load_block(BlockId(4)).is_err());
    }

    #[test]
    fn drop_cleans_spill_dir() {
        let dir = tempdir().unwrap();
        let spill = dir.path().join("spill");
        {
            let mut topend = FileTopend::new(spill.clone());
            let payload = vec![0u8; BLOCK_SIZE];
            let header = sample_header(5, &payload);
            topend.store_block(&header, &payload).unwrap();
            assert!(spill.join("5.block").exists());
        }
        assert!(!spill.exists());
    }
}
