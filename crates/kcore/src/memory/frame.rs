//! 物理页帧表
//!
//! 每个用户页帧记录引用计数、年龄、所属进程和映射到的虚拟地址。引用计数为 0 即空闲。
//! 页的内容在第一次分配时才真正申请内存，之后一直保留

use defines::{
    config::PAGE_SIZE,
    error::{errno, KResult},
};

use super::pte::Ppn;
use crate::process::Pid;

#[derive(Clone, Copy, Debug, Default)]
pub struct FrameEntry {
    pub count: u32,
    /// 自上次访问以来经历的时钟周期数
    pub age: u8,
    pub owner: Pid,
    pub vaddr: usize,
}

pub struct FrameTable {
    entries: Vec<FrameEntry>,
    pages: Vec<Option<Box<[u8]>>>,
    free: usize,
    /// 下一次从这里开始找空闲帧
    hint: usize,
}

impl FrameTable {
    pub fn new(frames: usize) -> Self {
        Self {
            entries: vec![FrameEntry::default(); frames],
            pages: (0..frames).map(|_| None).collect(),
            free: frames,
            hint: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.entries.len()
    }

    pub fn free_count(&self) -> usize {
        self.free
    }

    pub fn entry(&self, ppn: Ppn) -> &FrameEntry {
        &self.entries[ppn]
    }

    pub fn count(&self, ppn: Ppn) -> u32 {
        self.entries[ppn].count
    }

    /// 分配一个清零的页帧，引用计数为 1
    pub fn alloc(&mut self, owner: Pid, vaddr: usize) -> KResult<Ppn> {
        if self.free == 0 {
            return Err(errno::ENOMEM);
        }
        let total = self.total();
        let ppn = (0..total)
            .map(|i| (self.hint + i) % total)
            .find(|&ppn| self.entries[ppn].count == 0)
            .expect("free counter says a frame is available");
        self.hint = (ppn + 1) % total;
        self.free -= 1;
        self.entries[ppn] = FrameEntry {
            count: 1,
            age: 0,
            owner,
            vaddr,
        };
        self.pages[ppn]
            .get_or_insert_with(|| vec![0; PAGE_SIZE].into_boxed_slice())
            .fill(0);
        Ok(ppn)
    }

    /// 多一个共享者
    pub fn dup(&mut self, ppn: Ppn) {
        let entry = &mut self.entries[ppn];
        assert!(entry.count > 0, "dup of free frame {ppn}");
        entry.count += 1;
    }

    /// 少一个共享者，返回该帧是否因此被释放
    ///
    /// # Panics
    ///
    /// 释放一个空闲帧是致命错误
    pub fn put(&mut self, ppn: Ppn) -> bool {
        let entry = &mut self.entries[ppn];
        if entry.count == 0 {
            error!("double free of frame {ppn}");
            panic!("double free of frame {ppn}");
        }
        entry.count -= 1;
        if entry.count == 0 {
            self.free += 1;
            return true;
        }
        false
    }

    pub fn set_owner(&mut self, ppn: Ppn, owner: Pid, vaddr: usize) {
        let entry = &mut self.entries[ppn];
        entry.owner = owner;
        entry.vaddr = vaddr;
    }

    pub fn page(&self, ppn: Ppn) -> &[u8] {
        self.pages[ppn]
            .as_deref()
            .expect("a frame in use always has its page")
    }

    pub fn page_mut(&mut self, ppn: Ppn) -> &mut [u8] {
        self.pages[ppn]
            .as_deref_mut()
            .expect("a frame in use always has its page")
    }

    /// 将 `src` 的内容复制到 `dst`
    pub fn copy_page(&mut self, src: Ppn, dst: Ppn) {
        assert_ne!(src, dst);
        let (src_page, dst_page) = if src < dst {
            let (low, high) = self.pages.split_at_mut(dst);
            (&low[src], &mut high[0])
        } else {
            let (low, high) = self.pages.split_at_mut(src);
            (&high[0], &mut low[dst])
        };
        let (Some(src_page), Some(dst_page)) = (src_page, dst_page) else {
            panic!("copying between frames {src} and {dst} that were never allocated");
        };
        dst_page.copy_from_slice(src_page);
    }

    /// 被访问的页年龄归零
    pub fn touch(&mut self, ppn: Ppn) {
        self.entries[ppn].age = 0;
    }

    /// 时钟周期到来时所有在用页帧变老
    pub fn age_all(&mut self) {
        for entry in self.entries.iter_mut().filter(|entry| entry.count > 0) {
            entry.age = entry.age.saturating_add(1);
        }
    }

    /// 进程局部的近似 LRU：在 `pid` 独占的页帧中选出最老的一个，年龄相同时取编号小的。
    ///
    /// `accept` 用于排除映射已经对不上的候选
    pub fn victim(&self, pid: Pid, accept: impl Fn(Ppn, &FrameEntry) -> bool) -> Option<Ppn> {
        let mut best: Option<(Ppn, u8)> = None;
        for (ppn, entry) in self.entries.iter().enumerate() {
            if entry.count != 1 || entry.owner != pid {
                continue;
            }
            if best.map_or(true, |(_, age)| entry.age > age) && accept(ppn, entry) {
                best = Some((ppn, entry.age));
            }
        }
        best.map(|(ppn, _)| ppn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_until_exhausted() {
        let mut frames = FrameTable::new(2);
        let a = frames.alloc(Pid(1), 0).unwrap();
        let b = frames.alloc(Pid(1), 0x1000).unwrap();
        assert_ne!(a, b);
        assert_eq!(frames.alloc(Pid(1), 0x2000), Err(errno::ENOMEM));
        assert!(frames.put(a));
        assert_eq!(frames.free_count(), 1);
        assert_eq!(frames.alloc(Pid(2), 0).unwrap(), a);
    }

    #[test]
    fn shared_frame_is_freed_by_last_put() {
        let mut frames = FrameTable::new(4);
        let ppn = frames.alloc(Pid(1), 0).unwrap();
        frames.dup(ppn);
        frames.dup(ppn);
        assert!(!frames.put(ppn));
        assert!(!frames.put(ppn));
        assert_eq!(frames.count(ppn), 1);
        assert!(frames.put(ppn));
        assert_eq!(frames.free_count(), 4);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut frames = FrameTable::new(1);
        let ppn = frames.alloc(Pid(1), 0).unwrap();
        frames.put(ppn);
        frames.put(ppn);
    }

    #[test]
    fn reallocated_frame_is_zeroed() {
        let mut frames = FrameTable::new(1);
        let ppn = frames.alloc(Pid(1), 0).unwrap();
        frames.page_mut(ppn).fill(0xaa);
        frames.put(ppn);
        let ppn = frames.alloc(Pid(1), 0).unwrap();
        assert!(frames.page(ppn).iter().all(|&b| b == 0));
    }

    #[test]
    fn copy_works_in_both_directions() {
        let mut frames = FrameTable::new(3);
        let a = frames.alloc(Pid(1), 0).unwrap();
        let b = frames.alloc(Pid(1), 0).unwrap();
        frames.page_mut(b)[..3].copy_from_slice(b"abc");
        frames.copy_page(b, a);
        assert_eq!(&frames.page(a)[..3], b"abc");
        frames.page_mut(a)[0] = b'x';
        frames.copy_page(a, b);
        assert_eq!(&frames.page(b)[..3], b"xbc");
    }

    #[test]
    fn victim_is_oldest_private_frame_of_process() {
        let mut frames = FrameTable::new(4);
        let a = frames.alloc(Pid(1), 0).unwrap();
        frames.age_all();
        let b = frames.alloc(Pid(1), 0x1000).unwrap();
        let shared = frames.alloc(Pid(1), 0x2000).unwrap();
        frames.dup(shared);
        let other = frames.alloc(Pid(2), 0).unwrap();
        frames.age_all();
        frames.age_all();
        frames.age_all();
        // shared 最老但被共享，不能换出
        assert_eq!(frames.victim(Pid(1), |_, _| true), Some(a));
        frames.touch(a);
        assert_eq!(frames.victim(Pid(1), |_, _| true), Some(b));
        assert_eq!(frames.victim(Pid(1), |ppn, _| ppn != b), Some(a));
        assert_eq!(frames.victim(Pid(2), |_, _| true), Some(other));
        assert_eq!(frames.victim(Pid(3), |_, _| true), None);
    }
}
