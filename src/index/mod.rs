//! Index Module
//!
//! Disk-resident hash table mapping 32-bit key hashes to slots.
//!
//! ## Responsibilities
//! - Find the slot of a key by hash, with collisions settled by the caller
//! - Insert or refresh slots without ever duplicating a key
//! - Grow incrementally (linear hashing) as keys are added
//!
//! The index never sees key bytes. Every lookup takes a `resolve` callback
//! that decides whether a candidate slot belongs to the key in question;
//! the engine backs it with `Datalog::read_key`.
//!
//! ## Files
//! ```text
//! {dir}/
//!   ├── main.pix       (bucket i at offset i * 512)
//!   ├── overflow.pix   (chained overflow buckets, reused via a free list)
//!   └── index.pmt      (level, key count, split pointer, free list)
//! ```

mod bucket;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{KeyhiveError, Result};
use crate::file::DataFile;
use crate::meta::{read_meta_file, write_meta_file};
use crate::MAX_KEYS;

use bucket::{Bucket, BucketLoc};
pub use bucket::{Slot, BUCKET_SIZE, SLOTS_PER_BUCKET};

pub const INDEX_META_NAME: &str = "index.pmt";
pub const INDEX_MAIN_NAME: &str = "main.pix";
pub const INDEX_OVERFLOW_NAME: &str = "overflow.pix";

/// Average bucket fill that triggers a split
const LOAD_FACTOR: f32 = 0.7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IndexMeta {
    level: u8,
    num_keys: u32,
    num_buckets: u32,
    split_bucket_idx: u32,
    free_overflow_buckets: Vec<u64>,
}

impl Default for IndexMeta {
    fn default() -> Self {
        Self {
            level: 0,
            num_keys: 0,
            num_buckets: 1,
            split_bucket_idx: 0,
            free_overflow_buckets: Vec::new(),
        }
    }
}

/// Linear-hashing index over bucket files
pub struct Index {
    dir: PathBuf,
    main: DataFile,
    overflow: DataFile,
    meta: IndexMeta,
}

impl Index {
    /// Open the index in `dir`, creating an empty one if needed
    pub fn open(dir: &Path) -> Result<Self> {
        let main = DataFile::open(&dir.join(INDEX_MAIN_NAME))?;
        let overflow = DataFile::open(&dir.join(INDEX_OVERFLOW_NAME))?;

        let meta = match read_meta_file::<IndexMeta>(&dir.join(INDEX_META_NAME))? {
            Some(meta) => {
                if main.size() < meta.num_buckets as u64 * BUCKET_SIZE {
                    return Err(KeyhiveError::Corrupted(format!(
                        "index has {} buckets but main file holds {} bytes",
                        meta.num_buckets,
                        main.size()
                    )));
                }
                meta
            }
            None => {
                if main.size() > 0 || overflow.size() > 0 {
                    warn!("index files without metadata, starting with an empty index");
                    main.truncate(0)?;
                    overflow.truncate(0)?;
                }
                main.append(&Bucket::default().encode())?;
                IndexMeta::default()
            }
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            main,
            overflow,
            meta,
        })
    }

    /// Look up `hash`, asking `resolve` about each slot with that hash.
    ///
    /// Candidates are visited in bucket-chain order, each at most once; the
    /// walk stops at the first match or error.
    pub fn get<F>(&self, hash: u32, mut resolve: F) -> Result<bool>
    where
        F: FnMut(&Slot) -> Result<bool>,
    {
        let mut loc = self.main_loc(self.bucket_index(hash));
        let mut remaining = self.max_chain_len();
        loop {
            let bucket = self.read_bucket(loc)?;
            for slot in bucket.slots.iter().filter(|s| s.hash == hash) {
                if resolve(slot)? {
                    return Ok(true);
                }
            }
            match bucket.next {
                Some(offset) => loc = BucketLoc::Overflow(offset),
                None => return Ok(false),
            }
            remaining = self.step_chain(remaining)?;
        }
    }

    /// Insert `slot`, or replace the existing slot `resolve` matches.
    ///
    /// Returns true when an existing slot was replaced.
    pub fn put<F>(&mut self, slot: Slot, mut resolve: F) -> Result<bool>
    where
        F: FnMut(&Slot) -> Result<bool>,
    {
        let mut chain = self.read_chain(self.bucket_index(slot.hash))?;

        for (loc, bucket) in chain.iter_mut() {
            for i in 0..bucket.slots.len() {
                let candidate = bucket.slots[i];
                if candidate.hash == slot.hash && resolve(&candidate)? {
                    bucket.slots[i] = slot;
                    self.write_bucket(*loc, bucket)?;
                    return Ok(true);
                }
            }
        }

        if self.meta.num_keys as u64 >= MAX_KEYS {
            return Err(KeyhiveError::Full(format!("key count reached {}", MAX_KEYS)));
        }

        let overflow_offset = match chain.last() {
            Some((_, last)) if last.slots.len() >= SLOTS_PER_BUCKET => Some(self.alloc_overflow()?),
            _ => None,
        };
        let Some((last_loc, last)) = chain.last_mut() else {
            return Err(KeyhiveError::Corrupted("empty bucket chain".to_string()));
        };
        match overflow_offset {
            None => {
                last.slots.push(slot);
                self.write_bucket(*last_loc, last)?;
            }
            Some(offset) => {
                let bucket = Bucket { slots: vec![slot], next: None };
                self.write_bucket(BucketLoc::Overflow(offset), &bucket)?;
                last.next = Some(offset);
                self.write_bucket(*last_loc, last)?;
            }
        }

        self.meta.num_keys += 1;
        if self.load() > LOAD_FACTOR {
            self.split()?;
        }
        Ok(false)
    }

    /// Number of live slots
    pub fn count(&self) -> u32 {
        self.meta.num_keys
    }

    /// Number of main buckets
    pub fn num_buckets(&self) -> u32 {
        self.meta.num_buckets
    }

    /// Persist metadata and flush both bucket files
    pub fn close(&mut self) -> Result<()> {
        self.persist()
    }

    /// Make the current state durable; the index stays usable.
    pub(crate) fn persist(&self) -> Result<()> {
        let mut first_err = write_meta_file(&self.dir.join(INDEX_META_NAME), &self.meta).err();
        for file in [&self.main, &self.overflow] {
            if let Err(e) = file.sync() {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn load(&self) -> f32 {
        self.meta.num_keys as f32 / (self.meta.num_buckets as f32 * SLOTS_PER_BUCKET as f32)
    }

    /// Main bucket for `hash` under the current level and split pointer
    fn bucket_index(&self, hash: u32) -> u32 {
        let hash = hash as u64;
        let mut idx = hash & ((1u64 << self.meta.level) - 1);
        if idx < self.meta.split_bucket_idx as u64 {
            idx = hash & ((1u64 << (self.meta.level + 1)) - 1);
        }
        idx as u32
    }

    fn main_loc(&self, idx: u32) -> BucketLoc {
        BucketLoc::Main(idx as u64 * BUCKET_SIZE)
    }

    /// Chains can never be longer than the overflow file plus the main bucket
    fn max_chain_len(&self) -> u64 {
        self.overflow.size() / BUCKET_SIZE + 1
    }

    fn step_chain(&self, remaining: u64) -> Result<u64> {
        remaining
            .checked_sub(1)
            .filter(|r| *r > 0)
            .ok_or_else(|| KeyhiveError::Corrupted("cycle in index bucket chain".to_string()))
    }

    fn read_bucket(&self, loc: BucketLoc) -> Result<Bucket> {
        let mut data = vec![0u8; BUCKET_SIZE as usize];
        match loc {
            BucketLoc::Main(offset) => self.main.read_at(&mut data, offset)?,
            BucketLoc::Overflow(offset) => self.overflow.read_at(&mut data, offset)?,
        }
        Bucket::decode(&data)
    }

    fn write_bucket(&self, loc: BucketLoc, bucket: &Bucket) -> Result<()> {
        let data = bucket.encode();
        match loc {
            BucketLoc::Main(offset) => self.main.write_at(&data, offset),
            BucketLoc::Overflow(offset) => self.overflow.write_at(&data, offset),
        }
    }

    fn read_chain(&self, idx: u32) -> Result<Vec<(BucketLoc, Bucket)>> {
        let mut chain = Vec::new();
        let mut loc = self.main_loc(idx);
        let mut remaining = self.max_chain_len();
        loop {
            let bucket = self.read_bucket(loc)?;
            let next = bucket.next;
            chain.push((loc, bucket));
            match next {
                Some(offset) => loc = BucketLoc::Overflow(offset),
                None => return Ok(chain),
            }
            remaining = self.step_chain(remaining)?;
        }
    }

    fn alloc_overflow(&mut self) -> Result<u64> {
        if let Some(offset) = self.meta.free_overflow_buckets.pop() {
            return Ok(offset);
        }
        self.overflow.append(&Bucket::default().encode())
    }

    /// Split the bucket under the split pointer into itself and a new bucket
    fn split(&mut self) -> Result<()> {
        let old_idx = self.meta.split_bucket_idx;
        let new_idx = self.meta.num_buckets;

        self.meta.split_bucket_idx += 1;
        if self.meta.split_bucket_idx as u64 == 1u64 << self.meta.level {
            self.meta.level += 1;
            self.meta.split_bucket_idx = 0;
        }
        self.meta.num_buckets += 1;
        self.main
            .write_at(&Bucket::default().encode(), new_idx as u64 * BUCKET_SIZE)?;

        let chain = self.read_chain(old_idx)?;
        let mut spare: Vec<u64> = chain
            .iter()
            .filter_map(|(loc, _)| match loc {
                BucketLoc::Overflow(offset) => Some(*offset),
                BucketLoc::Main(_) => None,
            })
            .collect();
        let (stay, moved): (Vec<Slot>, Vec<Slot>) = chain
            .into_iter()
            .flat_map(|(_, bucket)| bucket.slots)
            .partition(|slot| self.bucket_index(slot.hash) == old_idx);

        self.write_chain(old_idx, &stay, &mut spare)?;
        self.write_chain(new_idx, &moved, &mut spare)?;
        self.meta.free_overflow_buckets.extend(spare);

        debug!(
            old_bucket = old_idx,
            new_bucket = new_idx,
            moved = moved.len(),
            "split index bucket"
        );
        Ok(())
    }

    /// Rewrite bucket `idx` and its overflow chain to hold exactly `slots`
    fn write_chain(&mut self, idx: u32, slots: &[Slot], spare: &mut Vec<u64>) -> Result<()> {
        let buckets_needed = slots.len().div_ceil(SLOTS_PER_BUCKET).max(1);
        let mut locs = vec![self.main_loc(idx)];
        for _ in 1..buckets_needed {
            let offset = match spare.pop() {
                Some(offset) => offset,
                None => self.alloc_overflow()?,
            };
            locs.push(BucketLoc::Overflow(offset));
        }

        let mut chunks = slots.chunks(SLOTS_PER_BUCKET);
        for (i, loc) in locs.iter().enumerate() {
            let next = match locs.get(i + 1) {
                Some(BucketLoc::Overflow(offset)) => Some(*offset),
                _ => None,
            };
            let bucket = Bucket {
                slots: chunks.next().map(<[Slot]>::to_vec).unwrap_or_default(),
                next,
            };
            self.write_bucket(*loc, &bucket)?;
        }
        Ok(())
    }
}
