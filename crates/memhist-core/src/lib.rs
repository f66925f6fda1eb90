//! In-memory aggregation engine for memory-access history recording.
//!
//! A recorder streams in physical memory accesses, each tagged with a
//! monotonically non-decreasing transition id. A [`SliceBuilder`] groups them
//! into [`Chunk`]s covering contiguous physical ranges, merging chunks
//! whenever an access bridges them, under configurable limits that bound both
//! peak memory and worst-case chunk sizes. Freezing the builder yields a
//! [`Slice`]: an address-ordered set of non-overlapping chunks with the
//! transition bounding box observed during insertion.
//!
//! Every access is kept verbatim, in insertion order within its chunk, so the
//! persistence layer can re-emit the exact stream it was fed.

use std::collections::BTreeMap;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AccessError {
    #[error("access size must be non-zero")]
    InvalidSize,
    #[error("access at {address:#x} with size {size} wraps around the 64-bit physical space")]
    AddressWrap { address: u64, size: u32 },
    #[error("transition {icount} is behind the slice's last transition {transition_last}")]
    BackwardTransition { icount: u64, transition_last: u64 },
}

/// A memory operation as recorded by the tracer.
///
/// The bit codes are part of the storage format and must stay stable.
/// `Execute` is recognized so trace formats can name it, but the history
/// store never persists it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Execute = 0b001,
    Write = 0b010,
    Read = 0b100,
}

impl Operation {
    /// Stable code stored in the `operation` columns.
    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// One physical memory access observed at one transition.
///
/// `virtual_address` is `None` when the recorder could not resolve a linear
/// address for the access (e.g. physical DMA traffic).
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MemoryAccess {
    pub transition_id: u64,
    pub physical_address: u64,
    pub size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_address: Option<u64>,
    pub operation: Operation,
}

/// Stable handle to an access inserted through [`SliceBuilder::insert`].
///
/// Handles index the builder's access arena. They survive chunk merges and
/// the [`SliceBuilder::build`] call, and are invalidated only when the built
/// [`Slice`] is dropped (or the builder is dropped without building).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct AccessHandle(u32);

/// A recorded access plus its link in the owning chunk's list.
///
/// Accesses are chained in insertion order, which is not address order.
#[derive(Debug, Clone)]
pub struct ChunkAccess {
    pub transition: u64,
    pub address: u64,
    pub size: u32,
    next: Option<AccessHandle>,
}

impl ChunkAccess {
    /// Handle of the next access in the chunk, or `None` at the tail.
    #[must_use]
    pub fn next(&self) -> Option<AccessHandle> {
        self.next
    }
}

/// Flat backing storage for access lists. Chunks link accesses by arena
/// index, so list splices are O(1) and handles stay valid while the arena
/// lives. Dropping the arena drops all accesses at once, with no recursion
/// through link chains.
#[derive(Debug, Default)]
struct AccessArena {
    nodes: Vec<ChunkAccess>,
}

impl AccessArena {
    fn alloc(&mut self, transition: u64, address: u64, size: u32) -> AccessHandle {
        let index = u32::try_from(self.nodes.len()).expect("access arena exceeds u32 indexing");
        self.nodes.push(ChunkAccess { transition, address, size, next: None });
        AccessHandle(index)
    }

    fn get(&self, handle: AccessHandle) -> &ChunkAccess {
        &self.nodes[handle.0 as usize]
    }

    fn get_mut(&mut self, handle: AccessHandle) -> &mut ChunkAccess {
        &mut self.nodes[handle.0 as usize]
    }
}

/// A group of accesses covering one contiguous physical-address range,
/// `[address_first, address_last]` inclusive.
///
/// Chunks do not carry transition bounds; those live on the enclosing slice.
#[derive(Debug)]
pub struct Chunk {
    address_first: u64,
    address_last: u64,
    head: AccessHandle,
    tail: AccessHandle,
    access_count: usize,
}

impl Chunk {
    /// Spawn a chunk holding a single access. The caller has already ruled
    /// out zero sizes and u64 wraparound.
    fn new(arena: &mut AccessArena, transition: u64, address: u64, size: u32) -> Self {
        let head = arena.alloc(transition, address, size);
        Self {
            address_first: address,
            address_last: address + (u64::from(size) - 1),
            head,
            tail: head,
            access_count: 1,
        }
    }

    #[must_use]
    pub fn address_first(&self) -> u64 {
        self.address_first
    }

    #[must_use]
    pub fn address_last(&self) -> u64 {
        self.address_last
    }

    /// Number of addresses covered, in bytes.
    #[must_use]
    pub fn address_size(&self) -> u64 {
        self.address_last - self.address_first + 1
    }

    /// Number of accesses stored.
    #[must_use]
    pub fn access_count(&self) -> usize {
        self.access_count
    }

    /// Handle of the first access inserted into this chunk. Iterate with
    /// [`Slice::accesses`] or [`ChunkAccess::next`].
    #[must_use]
    pub fn first_access(&self) -> AccessHandle {
        self.head
    }

    /// True when the two chunks share at least one address.
    #[must_use]
    pub fn overlaps(&self, other: &Chunk) -> bool {
        self.overlaps_range(other.address_first, other.address_last)
    }

    fn overlaps_range(&self, first: u64, last: u64) -> bool {
        !(self.address_last < first || last < self.address_first)
    }

    /// True when the ranges touch without sharing an address
    /// (`a.last + 1 == b.first`, either way around). Overlapping chunks are
    /// not contiguous.
    #[must_use]
    pub fn is_contiguous(&self, other: &Chunk) -> bool {
        self.address_last.checked_add(1) == Some(other.address_first)
            || other.address_last.checked_add(1) == Some(self.address_first)
    }

    /// Merge `other` into this chunk, splicing its access list onto the tail
    /// in O(1). Handles into `other` stay valid.
    ///
    /// Panics when either tail already has a successor: the splice would
    /// corrupt both lists, so this is treated as an engine bug.
    fn merge_in(&mut self, other: Chunk, arena: &mut AccessArena) {
        assert!(
            arena.get(self.tail).next.is_none(),
            "chunk merge: current tail already has a successor"
        );
        assert!(
            arena.get(other.tail).next.is_none(),
            "chunk merge: merged tail already has a successor"
        );
        self.address_first = self.address_first.min(other.address_first);
        self.address_last = self.address_last.max(other.address_last);
        arena.get_mut(self.tail).next = Some(other.head);
        self.tail = other.tail;
        self.access_count += other.access_count;
    }
}

/// Frozen output of a [`SliceBuilder`]: chunks ordered by address, none
/// overlapping, plus the transition bounding box observed during insertion.
#[derive(Debug)]
pub struct Slice {
    chunks: BTreeMap<u64, Chunk>,
    arena: AccessArena,
    transition_first: u64,
    transition_last: u64,
}

impl Slice {
    #[must_use]
    pub fn transition_first(&self) -> u64 {
        self.transition_first
    }

    #[must_use]
    pub fn transition_last(&self) -> u64 {
        self.transition_last
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Total number of accesses across all chunks.
    #[must_use]
    pub fn access_count(&self) -> usize {
        self.chunks.values().map(Chunk::access_count).sum()
    }

    /// Chunks in ascending address order.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    /// Resolve a handle returned by [`SliceBuilder::insert`].
    #[must_use]
    pub fn access(&self, handle: AccessHandle) -> &ChunkAccess {
        self.arena.get(handle)
    }

    /// Accesses of `chunk` in insertion order.
    pub fn accesses(&self, chunk: &Chunk) -> ChunkAccesses<'_> {
        ChunkAccesses { arena: &self.arena, cursor: Some(chunk.head) }
    }
}

/// Iterator over one chunk's accesses in insertion order.
pub struct ChunkAccesses<'a> {
    arena: &'a AccessArena,
    cursor: Option<AccessHandle>,
}

impl<'a> Iterator for ChunkAccesses<'a> {
    type Item = (AccessHandle, &'a ChunkAccess);

    fn next(&mut self) -> Option<Self::Item> {
        let handle = self.cursor?;
        let access = self.arena.get(handle);
        self.cursor = access.next;
        Some((handle, access))
    }
}

/// Accumulates accesses of a single operation into a [`Slice`], creating and
/// merging chunks as necessary.
///
/// Four optional limits shape the output. The overlap and access-count
/// limits are soft: they are crossed when refusing the access would break
/// the no-overlap invariant for a transition already present in the slice,
/// and the builder then refuses everything from the next transition on. The
/// transition limit is hard. The touch limit only applies to the final merge
/// pass in [`SliceBuilder::build`].
#[derive(Debug, Default)]
pub struct SliceBuilder {
    chunks: BTreeMap<u64, Chunk>,
    arena: AccessArena,
    transition_first: u64,
    transition_last: u64,
    chunk_size_overlap_limit: Option<u64>,
    chunk_size_touch_limit: Option<u64>,
    transition_limit: Option<u64>,
    access_count_limit: Option<u64>,
    stop_at_next_transition: bool,
    access_count: u64,
}

impl SliceBuilder {
    /// A builder with no limits and the stop latch clear.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Soft cap on the access count of a chunk produced by merging at
    /// insert time.
    #[must_use]
    pub fn chunk_size_overlap_limit(mut self, limit: u64) -> Self {
        self.chunk_size_overlap_limit = Some(limit);
        self
    }

    /// Soft cap on the access count of a chunk produced by merging touching
    /// neighbors at build time. Does not affect [`SliceBuilder::insert`].
    #[must_use]
    pub fn chunk_size_touch_limit(mut self, limit: u64) -> Self {
        self.chunk_size_touch_limit = Some(limit);
        self
    }

    /// Hard cap on the number of transitions the slice can span.
    #[must_use]
    pub fn transition_limit(mut self, limit: u64) -> Self {
        self.transition_limit = Some(limit);
        self
    }

    /// Soft cap on the total number of accesses in the slice.
    #[must_use]
    pub fn access_count_limit(mut self, limit: u64) -> Self {
        self.access_count_limit = Some(limit);
        self
    }

    /// Number of accesses inserted so far.
    #[must_use]
    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    /// Number of chunks currently held.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Insert one access into the slice under construction.
    ///
    /// Returns `Ok(None)` when a limit refuses the access. The refusal is
    /// not an error: the caller is expected to build the slice and retry on
    /// a fresh builder. On success, the returned handle resolves to the
    /// inserted access until the slice built from this builder is dropped.
    ///
    /// # Errors
    /// Returns [`AccessError::InvalidSize`] for a zero-sized access,
    /// [`AccessError::AddressWrap`] when `address + size - 1` does not fit
    /// in 64 bits, and [`AccessError::BackwardTransition`] when `icount` is
    /// behind a non-empty slice's last transition.
    pub fn insert(
        &mut self,
        icount: u64,
        address: u64,
        size: u32,
    ) -> Result<Option<AccessHandle>, AccessError> {
        if size == 0 {
            return Err(AccessError::InvalidSize);
        }

        if self.stop_at_next_transition && icount > self.transition_last {
            return Ok(None);
        }

        if let Some(limit) = self.access_count_limit {
            if self.access_count >= limit {
                if icount > self.transition_last {
                    return Ok(None);
                }
                // This transition is already part of the slice: take the
                // access and close the slice at the next transition instead.
                self.stop_at_next_transition = true;
            }
        }

        let Some(address_last) = address.checked_add(u64::from(size) - 1) else {
            return Err(AccessError::AddressWrap { address, size });
        };

        if !self.chunks.is_empty() && icount < self.transition_last {
            return Err(AccessError::BackwardTransition {
                icount,
                transition_last: self.transition_last,
            });
        }

        if let Some(limit) = self.transition_limit {
            if !self.chunks.is_empty() && icount - self.transition_first + 1 > limit {
                return Ok(None);
            }
        }

        // One logarithmic probe, then a linear walk over the contiguous
        // window of neighbors the new access bridges: the predecessor of the
        // upper bound once, then forward while overlap holds.
        let mut overlapping: Vec<u64> = Vec::new();
        let mut total_count: u64 = 1;
        if self.chunks.is_empty() {
            self.transition_first = icount;
        } else {
            if let Some((&key, previous)) = self.chunks.range(..=address).next_back() {
                if previous.overlaps_range(address, address_last) {
                    overlapping.push(key);
                    total_count += previous.access_count as u64;
                }
            }
            for (&key, next) in self.chunks.range((Bound::Excluded(address), Bound::Unbounded)) {
                if !next.overlaps_range(address, address_last) {
                    break;
                }
                overlapping.push(key);
                total_count += next.access_count as u64;
            }
        }

        if let Some(limit) = self.chunk_size_overlap_limit {
            if total_count > limit {
                if icount > self.transition_last {
                    return Ok(None);
                }
                // Same carve-out as the access-count limit: the merge must
                // happen to keep this transition's chunks non-overlapping.
                self.stop_at_next_transition = true;
            }
        }

        let mut chunk = Chunk::new(&mut self.arena, icount, address, size);
        let handle = chunk.first_access();
        for key in &overlapping {
            let other = self
                .chunks
                .remove(key)
                .expect("overlap probe returned a key that is no longer in the chunk map");
            chunk.merge_in(other, &mut self.arena);
        }

        self.transition_last = icount;
        self.chunks.insert(chunk.address_first, chunk);
        self.access_count += 1;
        Ok(Some(handle))
    }

    /// Freeze the slice.
    ///
    /// Runs the touch-merge pass first: adjacent contiguous chunks are
    /// folded together while their combined access count stays within
    /// `chunk_size_touch_limit` (always, when the limit is unset). Merging
    /// contiguous neighbors only here keeps `insert` cheap while still
    /// collapsing sequential access patterns into few chunks.
    #[must_use]
    pub fn build(mut self) -> Slice {
        self.merge_touching();
        Slice {
            chunks: self.chunks,
            arena: self.arena,
            transition_first: self.transition_first,
            transition_last: self.transition_last,
        }
    }

    fn merge_touching(&mut self) {
        let keys: Vec<u64> = self.chunks.keys().copied().collect();
        let Some((&first, rest)) = keys.split_first() else {
            return;
        };

        let mut current = first;
        for &next in rest {
            let mergeable = {
                let cur = &self.chunks[&current];
                let nxt = &self.chunks[&next];
                cur.is_contiguous(nxt)
                    && self.chunk_size_touch_limit.is_none_or(|limit| {
                        (cur.access_count + nxt.access_count) as u64 <= limit
                    })
            };
            if mergeable {
                let nxt = self.chunks.remove(&next).expect("key was collected from the map");
                let cur = self.chunks.get_mut(&current).expect("key was collected from the map");
                cur.merge_in(nxt, &mut self.arena);
            } else {
                current = next;
            }
        }
    }
}
