#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::vec::Vec;

/// 基于回收的分配器，即用 vector 收集释放的 id
///
/// 回收的 id 优先复用，且总是先复用最小的那个，这样 id 不会无限增长
#[derive(Clone, Debug)]
pub struct RecycleAllocator {
    current: usize,
    end: usize,
    recycled: Vec<usize>,
}

impl Default for RecycleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RecycleAllocator {
    /// 默认从 0 开始分配，没有上限
    pub const fn new() -> Self {
        Self::bounded(0, usize::MAX)
    }

    /// 显式决定从哪个数开始分配
    pub const fn begin_with(begin: usize) -> Self {
        Self::bounded(begin, usize::MAX)
    }

    /// 只分配 `begin..end` 范围内的 id
    pub const fn bounded(begin: usize, end: usize) -> Self {
        RecycleAllocator {
            current: begin,
            end,
            recycled: Vec::new(),
        }
    }

    /// id 耗尽时返回 `None`
    pub fn alloc(&mut self) -> Option<usize> {
        if !self.recycled.is_empty() {
            let (pos, _) = self
                .recycled
                .iter()
                .enumerate()
                .min_by_key(|(_, id)| **id)?;
            return Some(self.recycled.swap_remove(pos));
        }
        if self.current >= self.end {
            return None;
        }
        self.current += 1;
        Some(self.current - 1)
    }

    pub fn dealloc(&mut self, id: usize) {
        debug_assert!(id < self.current);
        debug_assert!(!self.recycled.contains(&id), "id {id} has been deallocated!");
        self.recycled.push(id);
    }
}
