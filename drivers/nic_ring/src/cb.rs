// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Software-side control blocks for in-flight buffers.
//!
//! Every block is on exactly one of two lists: the free list, or the work
//! list of blocks whose descriptors are owned by the device. Acquiring moves
//! a block from free to work in one step and completing moves it back, so
//! no block is ever on neither list or on both.

use alloc::{collections::VecDeque, vec::Vec};

use nic_base::{NicError, NicResult};

/// Which list a control block is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbList {
    Free,
    Work,
}

#[derive(Debug)]
struct ControlBlock<T> {
    list: CbList,
    slot: usize,
    ndesc: usize,
    payload: Option<T>,
}

/// A control block taken off the work list.
#[derive(Debug)]
pub struct Completed<T> {
    /// Descriptor slot the block was attached to.
    pub slot: usize,
    /// Descriptors the owning packet consumed; zero on continuation blocks.
    pub ndesc: usize,
    /// What the block kept alive while the device owned the slot.
    pub payload: Option<T>,
}

/// A fixed pool of control blocks with a free list and a FIFO work list.
#[derive(Debug)]
pub struct ControlBlockPool<T> {
    blocks: Vec<ControlBlock<T>>,
    free: VecDeque<usize>,
    work: VecDeque<usize>,
}

impl<T> ControlBlockPool<T> {
    /// Creates `count` blocks, all free.
    pub fn new(count: usize) -> Self {
        let blocks = (0..count)
            .map(|_| ControlBlock {
                list: CbList::Free,
                slot: 0,
                ndesc: 0,
                payload: None,
            })
            .collect();
        Self {
            blocks,
            free: (0..count).collect(),
            work: VecDeque::with_capacity(count),
        }
    }

    pub fn capacity(&self) -> usize {
        self.blocks.len()
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn work_len(&self) -> usize {
        self.work.len()
    }

    /// Slot of the oldest in-flight block.
    pub fn oldest_slot(&self) -> Option<usize> {
        self.work.front().map(|&id| self.blocks[id].slot)
    }

    /// Moves a free block to the tail of the work list, attached to `slot`.
    pub fn acquire(&mut self, slot: usize, ndesc: usize, payload: Option<T>) -> NicResult<usize> {
        let id = self.free.pop_front().ok_or(NicError::WouldBlock)?;
        let block = &mut self.blocks[id];
        debug_assert_eq!(block.list, CbList::Free);
        block.list = CbList::Work;
        block.slot = slot;
        block.ndesc = ndesc;
        block.payload = payload;
        self.work.push_back(id);
        Ok(id)
    }

    /// Moves the oldest in-flight block back to the free list.
    pub fn complete(&mut self) -> Option<Completed<T>> {
        let id = self.work.pop_front()?;
        Some(self.release(id))
    }

    /// Moves every in-flight block back to the free list, oldest first,
    /// whether or not the device finished with it.
    pub fn release_all(&mut self) -> impl Iterator<Item = Completed<T>> + '_ {
        core::iter::from_fn(move || self.complete())
    }

    /// Attaches a payload to the newest in-flight block.
    pub fn set_last_payload(&mut self, payload: T, ndesc: usize) -> NicResult {
        let id = *self.work.back().ok_or(NicError::BadState)?;
        let block = &mut self.blocks[id];
        block.payload = Some(payload);
        block.ndesc = ndesc;
        Ok(())
    }

    /// List membership of block `id`.
    pub fn list_of(&self, id: usize) -> Option<CbList> {
        self.blocks.get(id).map(|b| b.list)
    }

    /// Checks that every block is on exactly the list it claims.
    pub fn is_consistent(&self) -> bool {
        let mut seen = alloc::vec![0u8; self.blocks.len()];
        for &id in self.free.iter().chain(self.work.iter()) {
            seen[id] += 1;
        }
        self.free.len() + self.work.len() == self.blocks.len()
            && seen.iter().all(|&n| n == 1)
            && self.free.iter().all(|&id| self.blocks[id].list == CbList::Free)
            && self.work.iter().all(|&id| self.blocks[id].list == CbList::Work)
    }

    fn release(&mut self, id: usize) -> Completed<T> {
        let block = &mut self.blocks[id];
        debug_assert_eq!(block.list, CbList::Work);
        block.list = CbList::Free;
        let done = Completed {
            slot: block.slot,
            ndesc: core::mem::take(&mut block.ndesc),
            payload: block.payload.take(),
        };
        self.free.push_back(id);
        done
    }
}
