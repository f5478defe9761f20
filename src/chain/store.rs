// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2024 The Membercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Append-only block and undo file storage.
//!
//! Sequential `blk?????.dat` files hold serialized blocks, each prefixed with
//! the network magic and a little-endian length; paired `rev?????.dat` files
//! hold undo records with the same framing. Reindexing walks the block files
//! from zero until the first missing file.

use crate::codec;
use crate::coins::BlockUndo;
use crate::primitives::Block;
use bincode::{Decode, Encode};
use log::{info, warn};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Rotate to the next block file past this many bytes
pub const MAX_BLOCKFILE_SIZE: u64 = 128 * 1024 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Encode, Decode)]
pub struct DiskPos {
    pub file: u32,
    pub offset: u64,
}

#[derive(Debug)]
pub enum BlockStoreErr {
    Io(io::Error),
    Corruption(&'static str),
}

impl From<io::Error> for BlockStoreErr {
    fn from(err: io::Error) -> Self {
        BlockStoreErr::Io(err)
    }
}

pub trait BlockStore: Send + Sync {
    fn append_block(&self, block: &Block) -> Result<DiskPos, BlockStoreErr>;
    fn read_block(&self, pos: DiskPos) -> Result<Block, BlockStoreErr>;
    fn append_undo(&self, undo: &BlockUndo) -> Result<DiskPos, BlockStoreErr>;
    fn read_undo(&self, pos: DiskPos) -> Result<BlockUndo, BlockStoreErr>;
}

struct FileCursor {
    file: u32,
    block_offset: u64,
    undo_offset: u64,
}

pub struct FileBlockStore {
    dir: PathBuf,
    magic: [u8; 4],
    cursor: Mutex<FileCursor>,
}

impl FileBlockStore {
    pub fn open<P: AsRef<Path>>(dir: P, magic: [u8; 4]) -> Result<Self, BlockStoreErr> {
        std::fs::create_dir_all(&dir)?;
        let store = Self {
            dir: dir.as_ref().to_path_buf(),
            magic,
            cursor: Mutex::new(FileCursor {
                file: 0,
                block_offset: 0,
                undo_offset: 0,
            }),
        };
        store.restore_cursor()?;
        Ok(store)
    }

    fn block_path(&self, file: u32) -> PathBuf {
        self.dir.join(format!("blk{file:05}.dat"))
    }

    fn undo_path(&self, file: u32) -> PathBuf {
        self.dir.join(format!("rev{file:05}.dat"))
    }

    /// Find the last block file and its end offsets so appends continue
    /// where the previous run stopped.
    fn restore_cursor(&self) -> Result<(), BlockStoreErr> {
        let mut last = 0u32;
        while self.block_path(last + 1).exists() {
            last += 1;
        }
        let mut cursor = self.cursor.lock();
        cursor.file = last;
        cursor.block_offset = file_len(&self.block_path(last))?;
        cursor.undo_offset = file_len(&self.undo_path(last))?;
        Ok(())
    }

    fn append_frame(&self, path: &Path, payload: &[u8]) -> Result<u64, BlockStoreErr> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let offset = file.seek(SeekFrom::End(0))?;
        file.write_all(&self.magic)?;
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(payload)?;
        file.sync_data()?;
        Ok(offset)
    }

    fn read_frame(&self, path: &Path, offset: u64) -> Result<Vec<u8>, BlockStoreErr> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut head = [0u8; 8];
        file.read_exact(&mut head)?;
        if head[..4] != self.magic {
            return Err(BlockStoreErr::Corruption("bad frame magic"));
        }
        let len = u32::from_le_bytes([head[4], head[5], head[6], head[7]]) as usize;
        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Walk every block file from zero until a gap, yielding each stored
    /// block with its position. Used by reindex.
    pub fn scan_blocks<F>(&self, mut visit: F) -> Result<usize, BlockStoreErr>
    where
        F: FnMut(Block, DiskPos),
    {
        let mut total = 0usize;
        let mut file_no = 0u32;
        loop {
            let path = self.block_path(file_no);
            if !path.exists() {
                break;
            }
            let len = file_len(&path)?;
            let mut offset = 0u64;
            while offset + 8 <= len {
                let payload = match self.read_frame(&path, offset) {
                    Ok(payload) => payload,
                    Err(BlockStoreErr::Corruption(detail)) => {
                        warn!("stopping reindex scan at {path:?}:{offset}: {detail}");
                        break;
                    }
                    Err(err) => return Err(err),
                };
                let frame_len = 8 + payload.len() as u64;
                match codec::deserialize::<Block>(&payload) {
                    Ok(block) => visit(
                        block,
                        DiskPos {
                            file: file_no,
                            offset,
                        },
                    ),
                    Err(_) => {
                        warn!("undecodable block at {path:?}:{offset}");
                        break;
                    }
                }
                offset += frame_len;
                total += 1;
            }
            file_no += 1;
        }
        info!("scanned {total} stored blocks across {file_no} files");
        Ok(total)
    }
}

fn file_len(path: &Path) -> Result<u64, BlockStoreErr> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err.into()),
    }
}

impl BlockStore for FileBlockStore {
    fn append_block(&self, block: &Block) -> Result<DiskPos, BlockStoreErr> {
        let payload = codec::serialize(block);
        let mut cursor = self.cursor.lock();
        if cursor.block_offset + payload.len() as u64 + 8 > MAX_BLOCKFILE_SIZE
            && cursor.block_offset > 0
        {
            cursor.file += 1;
            cursor.block_offset = 0;
            cursor.undo_offset = 0;
        }
        let file = cursor.file;
        let offset = self.append_frame(&self.block_path(file), &payload)?;
        cursor.block_offset = offset + 8 + payload.len() as u64;
        Ok(DiskPos { file, offset })
    }

    fn read_block(&self, pos: DiskPos) -> Result<Block, BlockStoreErr> {
        let payload = self.read_frame(&self.block_path(pos.file), pos.offset)?;
        codec::deserialize(&payload).map_err(|_| BlockStoreErr::Corruption("undecodable block"))
    }

    fn append_undo(&self, undo: &BlockUndo) -> Result<DiskPos, BlockStoreErr> {
        let payload = codec::serialize(undo);
        let mut cursor = self.cursor.lock();
        let file = cursor.file;
        let offset = self.append_frame(&self.undo_path(file), &payload)?;
        cursor.undo_offset = offset + 8 + payload.len() as u64;
        Ok(DiskPos { file, offset })
    }

    fn read_undo(&self, pos: DiskPos) -> Result<BlockUndo, BlockStoreErr> {
        let payload = self.read_frame(&self.undo_path(pos.file), pos.offset)?;
        codec::deserialize(&payload)
            .map_err(|_| BlockStoreErr::Corruption("undecodable undo record"))
    }
}

/// Memory-only store for tests.
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: Mutex<Vec<Block>>,
    undos: Mutex<Vec<BlockUndo>>,
}

impl MemoryBlockStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for MemoryBlockStore {
    fn append_block(&self, block: &Block) -> Result<DiskPos, BlockStoreErr> {
        let mut blocks = self.blocks.lock();
        blocks.push(block.clone());
        Ok(DiskPos {
            file: 0,
            offset: blocks.len() as u64 - 1,
        })
    }

    fn read_block(&self, pos: DiskPos) -> Result<Block, BlockStoreErr> {
        self.blocks
            .lock()
            .get(pos.offset as usize)
            .cloned()
            .ok_or(BlockStoreErr::Corruption("block position out of range"))
    }

    fn append_undo(&self, undo: &BlockUndo) -> Result<DiskPos, BlockStoreErr> {
        let mut undos = self.undos.lock();
        undos.push(undo.clone());
        Ok(DiskPos {
            file: 0,
            offset: undos.len() as u64 - 1,
        })
    }

    fn read_undo(&self, pos: DiskPos) -> Result<BlockUndo, BlockStoreErr> {
        self.undos
            .lock()
            .get(pos.offset as usize)
            .cloned()
            .ok_or(BlockStoreErr::Corruption("undo position out of range"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::genesis_block;
    use crate::coins::{Coin, TxUndo};
    use crate::consensus::{Params, COIN};
    use crate::primitives::TxOut;
    use crate::vm::Script;

    fn sample_undo() -> BlockUndo {
        BlockUndo {
            tx_undos: vec![TxUndo {
                spent: vec![Coin::new(
                    TxOut {
                        value: 3 * COIN,
                        script_pubkey: Script(vec![0x51]),
                    },
                    9,
                    false,
                )],
            }],
        }
    }

    #[test]
    fn file_store_block_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let params = Params::regtest();
        let store = FileBlockStore::open(dir.path(), params.magic).unwrap();

        let block = genesis_block(&params);
        let pos = store.append_block(&block).unwrap();
        assert_eq!(pos, DiskPos { file: 0, offset: 0 });
        assert_eq!(store.read_block(pos).unwrap(), block);

        let pos2 = store.append_block(&block).unwrap();
        assert!(pos2.offset > 0);
        assert_eq!(store.read_block(pos2).unwrap(), block);
    }

    #[test]
    fn file_store_undo_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let params = Params::regtest();
        let store = FileBlockStore::open(dir.path(), params.magic).unwrap();

        let undo = sample_undo();
        let pos = store.append_undo(&undo).unwrap();
        assert_eq!(store.read_undo(pos).unwrap(), undo);
    }

    #[test]
    fn cursor_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let params = Params::regtest();
        let block = genesis_block(&params);

        let first_pos;
        {
            let store = FileBlockStore::open(dir.path(), params.magic).unwrap();
            first_pos = store.append_block(&block).unwrap();
        }

        let store = FileBlockStore::open(dir.path(), params.magic).unwrap();
        let second_pos = store.append_block(&block).unwrap();
        assert_eq!(second_pos.file, first_pos.file);
        assert!(second_pos.offset > first_pos.offset);
        assert_eq!(store.read_block(first_pos).unwrap(), block);
        assert_eq!(store.read_block(second_pos).unwrap(), block);
    }

    #[test]
    fn scan_blocks_walks_all_frames() {
        let dir = tempfile::tempdir().unwrap();
        let params = Params::regtest();
        let store = FileBlockStore::open(dir.path(), params.magic).unwrap();
        let block = genesis_block(&params);

        for _ in 0..5 {
            store.append_block(&block).unwrap();
        }

        let mut seen = Vec::new();
        let total = store
            .scan_blocks(|block, pos| seen.push((block.hash(), pos)))
            .unwrap();
        assert_eq!(total, 5);
        assert_eq!(seen.len(), 5);
        for (hash, pos) in seen {
            assert_eq!(hash, block.hash());
            assert_eq!(store.read_block(pos).unwrap().hash(), hash);
        }
    }

    #[test]
    fn bad_magic_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let params = Params::regtest();
        let store = FileBlockStore::open(dir.path(), params.magic).unwrap();
        let pos = store.append_block(&genesis_block(&params)).unwrap();

        let other = FileBlockStore::open(dir.path(), [0, 1, 2, 3]).unwrap();
        assert!(matches!(
            other.read_block(pos),
            Err(BlockStoreErr::Corruption(_))
        ));
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryBlockStore::new();
        let params = Params::regtest();
        let block = genesis_block(&params);
        let pos = store.append_block(&block).unwrap();
        assert_eq!(store.read_block(pos).unwrap(), block);

        let undo = sample_undo();
        let upos = store.append_undo(&undo).unwrap();
        assert_eq!(store.read_undo(upos).unwrap(), undo);
        assert!(matches!(
            store.read_block(DiskPos { file: 0, offset: 99 }),
            Err(BlockStoreErr::Corruption(_))
        ));
    }
}
