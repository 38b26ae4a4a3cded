// Copyright (c) 2024, The QuicVeil Project Authors.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright
//       notice, this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above
//       copyright notice, this list of conditions and the following disclaimer
//       in the documentation and/or other materials provided with the
//       distribution.
//
//     * Neither the name of the copyright holder nor the names of its
//       contributors may be used to endorse or promote products derived from
//       this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// OWNER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! # Optimization Module
//!
//! Foundational structures for the packet path: a pooled allocator for
//! fixed-size, cache-aligned buffers shared by the FEC codec and the
//! connection's send/receive paths.

use aligned_box::AlignedBox;
use crossbeam_queue::ArrayQueue;
use std::sync::Arc;

/// Alignment for pooled blocks, matching a cache line.
const BLOCK_ALIGN: usize = 64;

fn new_block(block_size: usize) -> AlignedBox<[u8]> {
    AlignedBox::slice_from_value(BLOCK_ALIGN, block_size, 0u8)
        .expect("aligned block allocation")
}

/// A thread-safe memory pool for fixed-size blocks.
/// Free blocks are kept on a concurrent queue to minimize lock contention.
pub struct MemoryPool {
    pool: Arc<ArrayQueue<AlignedBox<[u8]>>>,
    block_size: usize,
}

impl MemoryPool {
    /// Creates a new memory pool with a specified capacity and block size.
    /// All allocated blocks are 64-byte aligned.
    pub fn new(capacity: usize, block_size: usize) -> Self {
        let pool = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            let _ = pool.push(new_block(block_size));
        }
        Self {
            pool: Arc::new(pool),
            block_size,
        }
    }

    /// Allocates an aligned memory block from the pool.
    /// If the pool is empty, a new block is created.
    pub fn alloc(&self) -> AlignedBox<[u8]> {
        self.pool
            .pop()
            .unwrap_or_else(|| new_block(self.block_size))
    }

    /// Returns a memory block to the pool.
    /// If the pool is full, the block is dropped.
    pub fn free(&self, mut block: AlignedBox<[u8]>) {
        // Blocks are scrubbed before reuse so stale payloads never leak
        // into freshly allocated buffers.
        block.iter_mut().for_each(|x| *x = 0);
        let _ = self.pool.push(block);
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_cycle_scrubs_blocks() {
        let pool = MemoryPool::new(2, 64);
        let mut block = pool.alloc();
        block[0] = 0xAA;
        pool.free(block);
        let block = pool.alloc();
        assert_eq!(block[0], 0);
        assert_eq!(block.len(), 64);
    }

    #[test]
    fn exhausted_pool_falls_back_to_fresh_blocks() {
        let pool = MemoryPool::new(1, 32);
        let a = pool.alloc();
        let b = pool.alloc();
        assert_eq!(a.len(), 32);
        assert_eq!(b.len(), 32);
    }
}
