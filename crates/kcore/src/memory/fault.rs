//! 缺页处理
//!
//! 两类异常对应两个入口：页不存在走 [`Kernel::vfault`]，页存在但没有写权限走 [`Kernel::pfault`]，
//! 后者只用于打破写时复制

use defines::{
    config::{BLOCK_SIZE, PAGE_OFFSET_MASK, PAGE_SIZE},
    error::{errno, KResult},
};

use super::{
    pte::{PageState, Pte, PteFlags},
    region::{Backing, RegionId},
    MmGuard,
};
use crate::{
    process::{Pid, ProcTable},
    Kernel,
};

impl Kernel {
    /// 页不存在：按需清零、按需填充、换入，或者在栈下方自动增长栈
    pub fn vfault(&self, pid: Pid, addr: usize) -> KResult<()> {
        let mut procs = self.procs.lock();
        let mut mm = self.lock_mm();
        self.vfault_locked(&mut procs, &mut mm, pid, addr)
    }

    /// 页存在但不可写：写时复制。独占的页直接拿来用，共享的页复制一份
    pub fn pfault(&self, pid: Pid, addr: usize) -> KResult<()> {
        let mut procs = self.procs.lock();
        let mut mm = self.lock_mm();
        self.pfault_locked(&mut procs, &mut mm, pid, addr)
    }

    pub(crate) fn vfault_locked(
        &self,
        procs: &mut ProcTable,
        mm: &mut MmGuard<'_>,
        pid: Pid,
        addr: usize,
    ) -> KResult<()> {
        let pregion = procs.proc(pid)?.space.find(addr).ok_or(errno::EFAULT)?;
        let rid = pregion.region;
        let slot = pregion.slot(addr);
        self.with_region_locked(procs, mm, rid, |procs, mm| {
            let region = mm.regions.get(rid);
            if !region.in_use(slot) {
                if !region.is_downwards() {
                    return Err(errno::EFAULT);
                }
                // 栈顶以下、窗口以内的访问视为栈增长
                let wanted = region.page_of(slot) + 1;
                if wanted > self.config.max_stack_pages {
                    return Err(errno::EFAULT);
                }
                let delta = (wanted - region.pages()) as isize;
                let space = &mut procs.proc_mut(pid)?.space;
                self.grow_locked(space, mm, rid, delta)?;
                trace!("stack {rid} grows to {wanted} pages for {addr:#x}");
            }
            self.populate(procs, mm, pid, rid, slot, addr)
        })
    }

    pub(crate) fn pfault_locked(
        &self,
        procs: &mut ProcTable,
        mm: &mut MmGuard<'_>,
        pid: Pid,
        addr: usize,
    ) -> KResult<()> {
        let pregion = procs.proc(pid)?.space.find(addr).ok_or(errno::EFAULT)?;
        let rid = pregion.region;
        let slot = pregion.slot(addr);
        let page_va = addr & !PAGE_OFFSET_MASK;
        self.with_region_locked(procs, mm, rid, |procs, mm| {
            let pte = mm.regions.get(rid).pte(slot);
            let PageState::Present { ppn, cow: true } = pte.state else {
                return Err(errno::EFAULT);
            };
            let flags = pte.flags | PteFlags::WRITABLE;
            let ppn = if mm.frames.count(ppn) > 1 {
                let copy = self.alloc_frame(procs, mm, pid, page_va)?;
                mm.frames.copy_page(ppn, copy);
                mm.frames.put(ppn);
                trace!("copy-on-write at {addr:#x}: frame {ppn} copied to {copy}");
                copy
            } else {
                mm.frames.set_owner(ppn, pid, page_va);
                trace!("copy-on-write at {addr:#x}: process {pid} takes frame {ppn}");
                ppn
            };
            mm.regions
                .get_mut(rid)
                .set_pte(slot, Pte::new(PageState::Present { ppn, cow: false }, flags));
            Ok(())
        })
    }

    /// 让 `slot` 处的页常驻内存。调用者持有 region 的睡眠锁
    fn populate(
        &self,
        procs: &ProcTable,
        mm: &mut MmGuard<'_>,
        pid: Pid,
        rid: RegionId,
        slot: usize,
        addr: usize,
    ) -> KResult<()> {
        let region = mm.regions.get(rid);
        let pte = region.pte(slot);
        let page_va = addr & !PAGE_OFFSET_MASK;
        let ppn = match pte.state {
            PageState::Present { .. } => return Ok(()),
            PageState::Absent => return Err(errno::EFAULT),
            PageState::Swapped { .. } => {
                self.swap_in_locked(procs, mm, pid, rid, slot, addr)?;
                return Ok(());
            }
            PageState::DemandZero => {
                let ppn = self.alloc_frame(procs, mm, pid, page_va)?;
                trace!("demand-zero page at {addr:#x} gets frame {ppn}");
                ppn
            }
            PageState::DemandFill => {
                let page = region.page_of(slot);
                let backing = region
                    .backing()
                    .cloned()
                    .expect("demand-fill page without a backing file");
                let ppn = self.alloc_frame(procs, mm, pid, page_va)?;
                if let Err(e) = self.fill_page(&backing, page, mm.frames.page_mut(ppn)) {
                    warn!("fill of page {addr:#x} failed: {e}");
                    mm.frames.put(ppn);
                    return Err(e);
                }
                trace!("demand-fill page at {addr:#x} gets frame {ppn}");
                ppn
            }
        };
        mm.regions
            .get_mut(rid)
            .set_pte(slot, Pte::new(PageState::Present { ppn, cow: false }, pte.flags));
        Ok(())
    }

    /// 从后备文件读入逻辑页 `page`。超出映射长度的部分以及文件空洞保持为零
    fn fill_page(&self, backing: &Backing, page: usize, buf: &mut [u8]) -> KResult<()> {
        let start = page * PAGE_SIZE;
        let len = backing.size.saturating_sub(start).min(PAGE_SIZE);
        buf.fill(0);
        let mut done = 0;
        while done < len {
            let pos = backing.offset + start + done;
            let in_block = pos % BLOCK_SIZE;
            let chunk = (BLOCK_SIZE - in_block).min(len - done);
            if let Some(block) = backing.inode.bmap(pos / BLOCK_SIZE) {
                let buffer = self.bcache.bread(backing.inode.dev(), block)?;
                buf[done..done + chunk].copy_from_slice(&buffer.data()[in_block..in_block + chunk]);
                self.bcache.brelse(buffer);
            }
            done += chunk;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use defines::config::{
        PREGION_DATA, PREGION_STACK, PREGION_TEXT, REGION_MAX_SIZE, TABLE_SPAN, USER_BASE, USER_END,
    };

    use super::*;
    use crate::{
        fs::MemInode,
        memory::region::{RegionAccess, RegionFlags},
        process::Credentials,
        test_utils::{boot, kernel, kernel_with, kernel_with_disk, private_region},
        KernelConfig,
    };

    #[test]
    fn demand_zero_page_reads_as_zero() {
        let k = kernel();
        let pid = boot(&k);
        private_region(&k, pid, PREGION_DATA, USER_BASE, 1, RegionFlags::UPWARDS);
        assert_eq!(k.pte(pid, USER_BASE).unwrap().state, PageState::DemandZero);

        k.vfault(pid, USER_BASE).unwrap();
        assert!(k.pte(pid, USER_BASE).unwrap().is_present());
        let mut byte = [0xff; 1];
        k.read_user(pid, USER_BASE, &mut byte).unwrap();
        assert_eq!(byte, [0]);
        // 再次缺页什么也不做
        k.vfault(pid, USER_BASE).unwrap();
        assert_eq!(k.memory_stats().free_frames, k.memory_stats().total_frames - 1);
    }

    #[test]
    fn fault_outside_any_region_fails() {
        let k = kernel();
        let pid = boot(&k);
        private_region(&k, pid, PREGION_DATA, USER_BASE, 1, RegionFlags::UPWARDS);
        assert_eq!(k.vfault(pid, USER_BASE + PAGE_SIZE), Err(errno::EFAULT));
        assert_eq!(k.vfault(pid, USER_BASE + REGION_MAX_SIZE), Err(errno::EFAULT));
        assert_eq!(k.pfault(pid, USER_BASE), Err(errno::EFAULT));
    }

    #[test]
    fn demand_fill_reads_backing_and_pads_tail() {
        let (k, disk) = kernel_with_disk(KernelConfig::default());
        let pid = boot(&k);
        // 文件占三块，第二块是空洞；映射从文件偏移 512 开始，长 PAGE_SIZE + 100 字节
        let mut first = vec![0u8; BLOCK_SIZE];
        first[512..].fill(b'a');
        disk.write_block(10, &first).unwrap();
        let mut third = vec![b'c'; BLOCK_SIZE];
        third[0] = b'C';
        disk.write_block(11, &third).unwrap();
        for (i, block) in [12, 13, 14].into_iter().enumerate() {
            disk.write_block(block, &vec![b'd' + i as u8; BLOCK_SIZE]).unwrap();
        }
        let inode = Arc::new(MemInode::new(
            0,
            7,
            6 * BLOCK_SIZE,
            vec![Some(10), None, Some(11), Some(12), Some(13), Some(14)],
        ));
        let backing = Backing {
            inode,
            offset: 512,
            size: PAGE_SIZE + 100,
        };
        let rid = k
            .allocreg(
                RegionAccess::new(0o500, &Credentials::ROOT),
                2 * PAGE_SIZE,
                RegionFlags::empty(),
                Some(backing),
            )
            .unwrap();
        k.attachreg(pid, PREGION_TEXT, USER_BASE, rid).unwrap();
        k.unlockreg(rid);
        assert_eq!(k.pte(pid, USER_BASE).unwrap().state, PageState::DemandFill);
        assert_eq!(k.pte(pid, USER_BASE + PAGE_SIZE).unwrap().state, PageState::DemandFill);

        let mut page = vec![0; PAGE_SIZE];
        k.read_user(pid, USER_BASE, &mut page).unwrap();
        assert!(page[..512].iter().all(|&b| b == b'a'));
        assert!(page[512..1536].iter().all(|&b| b == 0));
        assert_eq!(page[1536], b'C');
        assert!(page[1537..2560].iter().all(|&b| b == b'c'));
        assert!(page[2560..3584].iter().all(|&b| b == b'd'));
        assert!(page[3584..].iter().all(|&b| b == b'e'));

        k.read_user(pid, USER_BASE + PAGE_SIZE, &mut page).unwrap();
        assert!(page[..100].iter().all(|&b| b == b'e'));
        assert!(page[100..].iter().all(|&b| b == 0));
        // 只读的 region 写不进去
        assert_eq!(k.write_user(pid, USER_BASE, b"x"), Err(errno::EFAULT));
    }

    #[test]
    fn stack_grows_down_on_fault() {
        let k = kernel();
        let pid = boot(&k);
        let top = USER_END - TABLE_SPAN;
        let rid = private_region(&k, pid, PREGION_STACK, top, 1, RegionFlags::DOWNWARDS);
        k.write_user(pid, top - 3 * PAGE_SIZE, b"deep").unwrap();
        assert_eq!(k.region_info(rid).unwrap().size, 3 * PAGE_SIZE);
        assert_eq!(k.process_size(pid).unwrap(), 3);
        // 中间新增的页仍是按需清零
        assert_eq!(
            k.pte(pid, top - 2 * PAGE_SIZE).unwrap().state,
            PageState::DemandZero
        );
    }

    #[test]
    fn stack_growth_is_bounded() {
        let k = kernel_with(KernelConfig::default().with_max_stack_pages(4));
        let pid = boot(&k);
        let top = USER_END - TABLE_SPAN;
        private_region(&k, pid, PREGION_STACK, top, 1, RegionFlags::DOWNWARDS);
        k.vfault(pid, top - 4 * PAGE_SIZE).unwrap();
        assert_eq!(k.vfault(pid, top - 5 * PAGE_SIZE), Err(errno::EFAULT));
        assert_eq!(k.process_size(pid).unwrap(), 4);
    }

    #[test]
    fn sole_owner_steals_cow_page() {
        let k = kernel();
        let parent = boot(&k);
        private_region(&k, parent, PREGION_DATA, USER_BASE, 1, RegionFlags::UPWARDS);
        k.write_user(parent, USER_BASE, b"before").unwrap();
        let child = k.fork(parent).unwrap();
        let ppn = k.pte(parent, USER_BASE).unwrap().ppn().unwrap();
        assert_eq!(k.frame_refs(ppn), 2);

        k.exit(child, 0).unwrap();
        assert_eq!(k.frame_refs(ppn), 1);
        let free = k.memory_stats().free_frames;
        k.pfault(parent, USER_BASE).unwrap();
        let pte = k.pte(parent, USER_BASE).unwrap();
        assert_eq!(pte.state, PageState::Present { ppn, cow: false });
        assert!(pte.is_writable());
        assert_eq!(k.memory_stats().free_frames, free);
    }

    #[test]
    fn protection_fault_without_cow_fails() {
        let k = kernel();
        let pid = boot(&k);
        let rid = k
            .allocreg(
                RegionAccess::new(0o400, &Credentials::ROOT),
                PAGE_SIZE,
                RegionFlags::empty(),
                None,
            )
            .unwrap();
        k.attachreg(pid, PREGION_TEXT, USER_BASE, rid).unwrap();
        k.unlockreg(rid);
        k.vfault(pid, USER_BASE).unwrap();
        assert_eq!(k.pfault(pid, USER_BASE), Err(errno::EFAULT));
    }
}
