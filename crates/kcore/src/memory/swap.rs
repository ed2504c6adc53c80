//! 交换区管理
//!
//! 交换区是块设备上 `swap_offset` 之后的一段连续空间，第 `slot` 槽位于 `swap_offset + slot * PAGE_SIZE`。
//! 位图记录槽是否被占用，引用计数允许同一份磁盘内容同时作为多个映射的后备（fork 之后被换出的共享页）

use defines::{
    config::PAGE_SIZE,
    error::{errno, KResult},
};

use super::{
    pte::{PageState, Ppn, Pte, PteFlags},
    region::RegionId,
    AddressSpace, MmGuard,
};
use crate::{
    process::{Pid, ProcTable},
    Kernel,
};

pub struct SwapTable {
    bitmap: Vec<u64>,
    counts: Vec<u16>,
    used: usize,
}

impl SwapTable {
    pub fn new(slots: usize) -> Self {
        Self {
            bitmap: vec![0; slots.div_ceil(64)],
            counts: vec![0; slots],
            used: 0,
        }
    }

    pub fn slots(&self) -> usize {
        self.counts.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn count(&self, slot: usize) -> u16 {
        self.counts[slot]
    }

    pub fn is_allocated(&self, slot: usize) -> bool {
        self.bitmap[slot / 64] & (1 << (slot % 64)) != 0
    }

    /// 第一个空闲槽，引用计数为 1
    pub fn alloc(&mut self) -> KResult<usize> {
        let slots = self.slots();
        for (i, word) in self.bitmap.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let slot = i * 64 + word.trailing_ones() as usize;
            if slot >= slots {
                break;
            }
            *word |= 1 << (slot % 64);
            self.counts[slot] = 1;
            self.used += 1;
            return Ok(slot);
        }
        Err(errno::ENOSPC)
    }

    pub fn dup(&mut self, slot: usize) {
        assert!(self.counts[slot] > 0, "dup of free swap slot {slot}");
        self.counts[slot] += 1;
    }

    /// 引用计数减一，降为 0 时清除位图。返回该槽是否因此被释放
    ///
    /// # Panics
    ///
    /// 释放空闲槽是致命错误
    pub fn free(&mut self, slot: usize) -> bool {
        if self.counts[slot] == 0 {
            error!("double free of swap slot {slot}");
            panic!("double free of swap slot {slot}");
        }
        self.counts[slot] -= 1;
        if self.counts[slot] > 0 {
            return false;
        }
        self.bitmap[slot / 64] &= !(1 << (slot % 64));
        self.used -= 1;
        true
    }
}

impl Kernel {
    fn swap_offset(&self, slot: usize) -> usize {
        self.config.swap_offset + slot * PAGE_SIZE
    }

    /// 将 `pid` 在 `addr` 处的页换出，返回所用的交换槽
    pub fn swap_out(&self, pid: Pid, addr: usize) -> KResult<usize> {
        let procs = self.procs.lock();
        let mut mm = self.lock_mm();
        let space = &procs.proc(pid)?.space;
        self.swap_out_locked(space, &mut mm, addr)
    }

    /// 将 `pid` 在 `addr` 处已换出的页换回，返回新的页帧
    pub fn swap_in(&self, pid: Pid, addr: usize) -> KResult<Ppn> {
        let procs = self.procs.lock();
        let mut mm = self.lock_mm();
        let (rid, slot) = procs.proc(pid)?.space.translate(addr).ok_or(errno::EFAULT)?;
        self.swap_in_locked(&procs, &mut mm, pid, rid, slot, addr)
    }

    /// 在内存紧张时换出 `pid` 最老的一个独占页，返回所用的交换槽
    pub fn reclaim(&self, pid: Pid) -> KResult<usize> {
        let procs = self.procs.lock();
        let mut mm = self.lock_mm();
        self.reclaim_locked(&procs, &mut mm, pid)
    }

    pub(crate) fn swap_out_locked(
        &self,
        space: &AddressSpace,
        mm: &mut MmGuard<'_>,
        addr: usize,
    ) -> KResult<usize> {
        let (rid, idx) = space.translate(addr).ok_or(errno::EFAULT)?;
        let pte = mm.regions.get(rid).pte(idx);
        let PageState::Present { ppn, cow } = pte.state else {
            return Err(errno::EINVAL);
        };
        // 先占住槽再写盘，写盘期间别人拿不到同一个槽。写的是页的快照
        let slot = mm.swap.alloc()?;
        let scratch: Box<[u8]> = mm.frames.page(ppn).into();
        if let Err(e) = self.swap_dev.write_at(self.swap_offset(slot), &scratch) {
            warn!("swap out of {addr:#x} to slot {slot} failed: {e}");
            mm.swap.free(slot);
            return Err(e);
        }
        mm.regions.get_mut(rid).set_pte(
            idx,
            Pte::new(
                PageState::Swapped { slot, cow },
                pte.flags - PteFlags::ACCESSED - PteFlags::DIRTY,
            ),
        );
        mm.frames.put(ppn);
        debug!("page {addr:#x} (frame {ppn}) swapped out to slot {slot}");
        Ok(slot)
    }

    pub(crate) fn swap_in_locked(
        &self,
        procs: &ProcTable,
        mm: &mut MmGuard<'_>,
        pid: Pid,
        rid: RegionId,
        idx: usize,
        addr: usize,
    ) -> KResult<Ppn> {
        let pte = mm.regions.get(rid).pte(idx);
        let PageState::Swapped { slot, cow } = pte.state else {
            return Err(errno::EINVAL);
        };
        let page_va = addr & !(PAGE_SIZE - 1);
        let ppn = self.alloc_frame(procs, mm, pid, page_va)?;
        if let Err(e) = self
            .swap_dev
            .read_at(self.swap_offset(slot), mm.frames.page_mut(ppn))
        {
            warn!("swap in of {addr:#x} from slot {slot} failed: {e}");
            mm.frames.put(ppn);
            return Err(e);
        }
        mm.regions
            .get_mut(rid)
            .set_pte(idx, Pte::new(PageState::Present { ppn, cow }, pte.flags));
        mm.swap.free(slot);
        debug!("page {addr:#x} swapped in from slot {slot} to frame {ppn}");
        Ok(ppn)
    }

    pub(crate) fn reclaim_locked(
        &self,
        procs: &ProcTable,
        mm: &mut MmGuard<'_>,
        pid: Pid,
    ) -> KResult<usize> {
        let space = &procs.proc(pid)?.space;
        let regions = &mm.regions;
        let victim = mm.frames.victim(pid, |ppn, entry| {
            space
                .translate(entry.vaddr)
                .is_some_and(|(rid, idx)| regions.get(rid).pte(idx).ppn() == Some(ppn))
        });
        let Some(ppn) = victim else {
            return Err(errno::ENOMEM);
        };
        let vaddr = mm.frames.entry(ppn).vaddr;
        self.swap_out_locked(space, mm, vaddr)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use defines::config::{PAGE_SIZE, PREGION_DATA, USER_BASE};

    use super::*;
    use crate::{
        fs::BlockDevice,
        memory::region::RegionFlags,
        test_utils::{boot, kernel_with_disk, private_region},
        KernelConfig,
    };

    #[test]
    fn bitmap_tracks_counts() {
        let mut swap = SwapTable::new(70);
        for expected in 0..70 {
            assert_eq!(swap.alloc(), Ok(expected));
        }
        assert_eq!(swap.alloc(), Err(errno::ENOSPC));
        swap.dup(65);
        assert!(!swap.free(65));
        assert!(swap.is_allocated(65));
        assert!(swap.free(65));
        assert!(!swap.is_allocated(65));
        assert_eq!(swap.alloc(), Ok(65));
        assert_eq!(swap.used(), 70);
    }

    #[test]
    fn swap_round_trip_restores_content() {
        let (k, _disk) = kernel_with_disk(KernelConfig::default());
        let pid = boot(&k);
        private_region(&k, pid, PREGION_DATA, USER_BASE, 2, RegionFlags::UPWARDS);
        let data: Vec<u8> = (0..PAGE_SIZE).map(|i| (i * 7) as u8).collect();
        k.write_user(pid, USER_BASE, &data).unwrap();
        let free_before = k.memory_stats().free_frames;

        let slot = k.swap_out(pid, USER_BASE).unwrap();
        assert_eq!(k.swap.lock().count(slot), 1);
        assert_eq!(k.memory_stats().free_frames, free_before + 1);
        assert!(matches!(
            k.pte(pid, USER_BASE).unwrap().state,
            PageState::Swapped { .. }
        ));

        k.swap_in(pid, USER_BASE).unwrap();
        assert_eq!(k.swap.lock().count(slot), 0);
        assert!(!k.swap.lock().is_allocated(slot));
        let mut back = vec![0; PAGE_SIZE];
        k.read_user(pid, USER_BASE, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn touching_a_swapped_page_swaps_it_in() {
        let (k, _disk) = kernel_with_disk(KernelConfig::default());
        let pid = boot(&k);
        private_region(&k, pid, PREGION_DATA, USER_BASE, 1, RegionFlags::UPWARDS);
        k.write_user(pid, USER_BASE + 10, b"swapped").unwrap();
        k.swap_out(pid, USER_BASE).unwrap();
        let mut back = [0; 7];
        k.read_user(pid, USER_BASE + 10, &mut back).unwrap();
        assert_eq!(&back, b"swapped");
        assert_eq!(k.memory_stats().swap_used, 0);
    }

    #[test]
    fn swapped_page_is_shared_by_fork() {
        let (k, _disk) = kernel_with_disk(KernelConfig::default());
        let parent = boot(&k);
        private_region(&k, parent, PREGION_DATA, USER_BASE, 1, RegionFlags::UPWARDS);
        k.write_user(parent, USER_BASE, b"on disk").unwrap();
        let slot = k.swap_out(parent, USER_BASE).unwrap();

        let child = k.fork(parent).unwrap();
        // 双方共用同一个槽，不重复写盘
        assert_eq!(k.swap.lock().count(slot), 2);
        assert_eq!(k.memory_stats().swap_used, 1);
        for pid in [parent, child] {
            let pte = k.pte(pid, USER_BASE).unwrap();
            assert_eq!(pte.state, PageState::Swapped { slot, cow: true });
            assert!(!pte.is_writable());
        }

        k.write_user(child, USER_BASE, b"ON DISK").unwrap();
        assert_eq!(k.swap.lock().count(slot), 1);
        assert!(k.swap.lock().is_allocated(slot));

        let mut back = [0; 7];
        k.read_user(parent, USER_BASE, &mut back).unwrap();
        assert_eq!(&back, b"on disk");
        assert_eq!(k.swap.lock().count(slot), 0);
        assert!(!k.swap.lock().is_allocated(slot));
        k.read_user(child, USER_BASE, &mut back).unwrap();
        assert_eq!(&back, b"ON DISK");
        k.assert_region_invariants();
    }

    struct BrokenDisk;

    impl BlockDevice for BrokenDisk {
        fn read_at(&self, _offset: usize, _buf: &mut [u8]) -> KResult<()> {
            Err(errno::EIO)
        }

        fn write_at(&self, _offset: usize, _buf: &[u8]) -> KResult<()> {
            Err(errno::EIO)
        }
    }

    #[test]
    fn failed_write_leaves_pte_alone() {
        let disk = Arc::new(crate::drivers::RamDisk::new(0, 1 << 20));
        let k = Kernel::new(KernelConfig::default(), Arc::new(BrokenDisk), disk);
        let pid = boot(&k);
        private_region(&k, pid, PREGION_DATA, USER_BASE, 1, RegionFlags::UPWARDS);
        k.write_user(pid, USER_BASE, b"x").unwrap();
        let before = k.pte(pid, USER_BASE).unwrap();
        assert_eq!(k.swap_out(pid, USER_BASE), Err(errno::EIO));
        assert_eq!(k.pte(pid, USER_BASE).unwrap(), before);
        assert_eq!(k.memory_stats().swap_used, 0);
    }

    #[test]
    fn frame_pressure_evicts_oldest_page() {
        let (k, _disk) = kernel_with_disk(KernelConfig::default().with_frames(2));
        let pid = boot(&k);
        private_region(&k, pid, PREGION_DATA, USER_BASE, 3, RegionFlags::UPWARDS);
        k.write_user(pid, USER_BASE, b"first").unwrap();
        k.tick();
        k.write_user(pid, USER_BASE + PAGE_SIZE, b"second").unwrap();
        // 第三页只能靠换出最老的第一页得到页帧
        k.write_user(pid, USER_BASE + 2 * PAGE_SIZE, b"third").unwrap();
        assert!(matches!(
            k.pte(pid, USER_BASE).unwrap().state,
            PageState::Swapped { .. }
        ));
        let mut back = [0; 5];
        k.read_user(pid, USER_BASE, &mut back).unwrap();
        assert_eq!(&back, b"first");
    }
}
