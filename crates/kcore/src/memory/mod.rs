//! 进程-region 内存模型：页表项、页帧表、region 表、pregion 挂载、缺页处理与交换
//!
//! region 的睡眠锁（`lockreg`/`unlockreg`）与各张表的自旋锁是两回事：自旋锁只在一次操作内持有，
//! 睡眠锁可以跨越调度点。拿不到睡眠锁的线程睡在 region 的链上，并以 `ERESTART` 返回，
//! 被唤醒后由调用者重新发起整个操作

pub mod fault;
pub mod frame;
pub mod pregion;
pub mod pte;
pub mod region;
pub mod swap;
mod user;

use defines::{
    config::{MASTER_CORE, PAGE_SIZE, PREGION_HEAP, PRI_REGION},
    error::{errno, KResult},
};
use klocks::SpinMutexGuard;

pub use self::pregion::{AddressSpace, Pde, Pregion};
use self::{
    frame::FrameTable,
    pte::{Ppn, Pte},
    region::{Backing, RegionAccess, RegionFlags, RegionId, RegionTable},
    swap::SwapTable,
};
use crate::{
    process::{Pid, ProcTable},
    sleep::ChainId,
    thread::Tid,
    Kernel,
};

/// 一次拿齐的内存相关的锁
pub(crate) struct MmGuard<'a> {
    pub regions: SpinMutexGuard<'a, RegionTable>,
    pub frames: SpinMutexGuard<'a, FrameTable>,
    pub swap: SpinMutexGuard<'a, SwapTable>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryStats {
    pub free_frames: usize,
    pub total_frames: usize,
    pub live_regions: usize,
    pub swap_used: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionInfo {
    pub flags: RegionFlags,
    pub count: usize,
    pub size: usize,
    pub holder: Option<Tid>,
}

/// 字节数换算成页数，正负号保持不变，不足一页的按一页算
fn bytes_to_pages(delta: isize) -> isize {
    let pages = delta.unsigned_abs().div_ceil(PAGE_SIZE) as isize;
    if delta < 0 {
        -pages
    } else {
        pages
    }
}

impl Kernel {
    /// 分配一个 region，返回时已被当前线程锁住
    pub fn allocreg(
        &self,
        access: RegionAccess,
        size: usize,
        flags: RegionFlags,
        backing: Option<Backing>,
    ) -> KResult<RegionId> {
        let procs = self.procs.lock();
        let tid = procs.current(MASTER_CORE);
        self.regions.lock().alloc(access, size, flags, backing, tid)
    }

    /// 获取 region 的睡眠锁。被占用时当前线程睡在该 region 的链上并返回 `ERESTART`
    pub fn lockreg(&self, rid: RegionId) -> KResult<()> {
        let mut procs = self.procs.lock();
        let mut regions = self.regions.lock();
        self.lockreg_locked(&mut procs, &mut regions, rid)
    }

    /// # Panics
    ///
    /// 只有持有者能解锁
    pub fn unlockreg(&self, rid: RegionId) {
        let mut procs = self.procs.lock();
        let mut regions = self.regions.lock();
        Self::unlockreg_locked(&mut procs, &mut regions, rid);
    }

    /// 释放一个无人引用、也没有被别的线程锁住的 region
    pub fn freereg(&self, rid: RegionId) -> KResult<()> {
        let mut procs = self.procs.lock();
        let mut mm = self.lock_mm();
        let region = mm.regions.live(rid)?;
        let tid = procs.current(MASTER_CORE);
        if region.count() > 0 || region.holder().is_some_and(|holder| holder != tid) {
            return Err(errno::EBUSY);
        }
        mm.regions.free(rid, &mut mm.frames, &mut mm.swap);
        procs.wakeup(ChainId::Region(rid));
        Ok(())
    }

    /// 清除 `STICKY`，无人引用时随之释放
    pub fn unstickreg(&self, rid: RegionId) -> KResult<()> {
        let mut procs = self.procs.lock();
        let mut mm = self.lock_mm();
        mm.regions.live(rid)?;
        mm.regions.unstick(rid, &mut mm.frames, &mut mm.swap);
        procs.wakeup(ChainId::Region(rid));
        Ok(())
    }

    /// 复制 region。私有 region 的复制在源 region 的锁内进行，返回的新 region 已被当前线程锁住
    pub fn dupreg(&self, rid: RegionId) -> KResult<RegionId> {
        let mut procs = self.procs.lock();
        let mut mm = self.lock_mm();
        self.with_region_locked(&mut procs, &mut mm, rid, |procs, mm| {
            let tid = procs.current(MASTER_CORE);
            mm.regions.dup(rid, tid, &mut mm.frames, &mut mm.swap)
        })
    }

    /// 按字节增减第 `slot` 个 pregion 的大小，不足一页按一页算
    pub fn growreg(&self, pid: Pid, slot: usize, delta: isize) -> KResult<()> {
        let _enter = debug_span!("growreg", pid = pid.0, slot = slot).entered();
        let mut procs = self.procs.lock();
        let mut mm = self.lock_mm();
        let rid = procs
            .proc(pid)?
            .space
            .pregion(slot)
            .ok_or(errno::EINVAL)?
            .region;
        self.with_region_locked(&mut procs, &mut mm, rid, |procs, mm| {
            let space = &mut procs.proc_mut(pid)?.space;
            self.grow_locked(space, mm, rid, bytes_to_pages(delta))
        })
    }

    /// 调整堆的大小，返回调整前的断点
    pub fn sbrk(&self, pid: Pid, delta: isize) -> KResult<usize> {
        let mut procs = self.procs.lock();
        let mut mm = self.lock_mm();
        let heap = procs
            .proc(pid)?
            .space
            .pregion(PREGION_HEAP)
            .ok_or(errno::EINVAL)?;
        let rid = heap.region;
        self.with_region_locked(&mut procs, &mut mm, rid, |procs, mm| {
            let old_break = heap.addr + mm.regions.get(rid).size();
            let space = &mut procs.proc_mut(pid)?.space;
            self.grow_locked(space, mm, rid, bytes_to_pages(delta))?;
            Ok(old_break)
        })
    }

    pub fn region_info(&self, rid: RegionId) -> KResult<RegionInfo> {
        let regions = self.regions.lock();
        let region = regions.live(rid)?;
        Ok(RegionInfo {
            flags: region.flags(),
            count: region.count(),
            size: region.size(),
            holder: region.holder(),
        })
    }

    /// `pid` 在 `addr` 处的页表项
    pub fn pte(&self, pid: Pid, addr: usize) -> KResult<Pte> {
        let procs = self.procs.lock();
        let (rid, slot) = procs
            .proc(pid)?
            .space
            .translate(addr)
            .ok_or(errno::EFAULT)?;
        Ok(self.regions.lock().get(rid).pte(slot))
    }

    pub fn frame_refs(&self, ppn: Ppn) -> u32 {
        self.frames.lock().count(ppn)
    }

    pub fn process_size(&self, pid: Pid) -> KResult<usize> {
        Ok(self.procs.lock().proc(pid)?.space.size())
    }

    pub fn memory_stats(&self) -> MemoryStats {
        let mm = self.lock_mm();
        MemoryStats {
            free_frames: mm.frames.free_count(),
            total_frames: mm.frames.total(),
            live_regions: mm.regions.live_count(),
            swap_used: mm.swap.used(),
        }
    }

    pub(crate) fn lockreg_locked(
        &self,
        procs: &mut ProcTable,
        regions: &mut RegionTable,
        rid: RegionId,
    ) -> KResult<()> {
        let tid = procs.current(MASTER_CORE);
        if regions.try_lock(rid, tid)? {
            return Ok(());
        }
        trace!("{rid} is busy, thread {tid} waits for it");
        self.sleep_locked(procs, ChainId::Region(rid), PRI_REGION)?;
        Err(errno::ERESTART)
    }

    pub(crate) fn unlockreg_locked(procs: &mut ProcTable, regions: &mut RegionTable, rid: RegionId) {
        let tid = procs.current(MASTER_CORE);
        regions.unlock(rid, tid);
        procs.wakeup(ChainId::Region(rid));
    }

    /// 持有 `rid` 的睡眠锁执行 `f`，无论成败都会解锁并唤醒等待者
    pub(crate) fn with_region_locked<T>(
        &self,
        procs: &mut ProcTable,
        mm: &mut MmGuard<'_>,
        rid: RegionId,
        f: impl FnOnce(&mut ProcTable, &mut MmGuard<'_>) -> KResult<T>,
    ) -> KResult<T> {
        self.lockreg_locked(procs, &mut mm.regions, rid)?;
        let mut guard = scopeguard::guard((procs, mm), |(procs, mm)| {
            Self::unlockreg_locked(procs, &mut mm.regions, rid);
        });
        let (procs, mm) = &mut *guard;
        f(procs, mm)
    }

    /// 调用者持有 region 的睡眠锁
    pub(crate) fn grow_locked(
        &self,
        space: &mut AddressSpace,
        mm: &mut MmGuard<'_>,
        rid: RegionId,
        delta: isize,
    ) -> KResult<()> {
        let region = mm.regions.live(rid)?;
        if region.is_shared() || !region.is_growable() {
            return Err(errno::EINVAL);
        }
        let old = region.pages();
        let new = old.checked_add_signed(delta).ok_or(errno::EINVAL)?;
        if new > old && space.size + (new - old) > self.config.max_proc_pages {
            return Err(errno::ENOMEM);
        }
        mm.regions.resize(rid, new, &mut mm.frames, &mut mm.swap)?;
        space.size = space.size + new - old;
        debug!("{rid} grows from {old} to {new} pages");
        Ok(())
    }

    /// 分配一个页帧。页帧耗尽时先换出 `pid` 最老的页
    pub(crate) fn alloc_frame(
        &self,
        procs: &ProcTable,
        mm: &mut MmGuard<'_>,
        pid: Pid,
        vaddr: usize,
    ) -> KResult<Ppn> {
        match mm.frames.alloc(pid, vaddr) {
            Err(e) if e == errno::ENOMEM => {
                let slot = self.reclaim_locked(procs, mm, pid)?;
                trace!("frame table is full, a page of process {pid} went to slot {slot}");
                mm.frames.alloc(pid, vaddr)
            }
            res => res,
        }
    }

    /// region 的引用计数恰好等于挂载它的 pregion 数，空闲的 region 不被任何 pregion 引用
    #[cfg(test)]
    pub(crate) fn assert_region_invariants(&self) {
        let procs = self.procs.lock();
        let regions = self.regions.lock();
        let mut attached = vec![0; defines::config::NR_REGIONS];
        for proc in procs.procs() {
            for (_, pregion) in proc.space.pregions() {
                assert!(
                    regions.live(pregion.region).is_ok(),
                    "process {} refers to free {}",
                    proc.pid(),
                    pregion.region
                );
                attached[pregion.region.0] += 1;
            }
        }
        for (rid, region) in regions.iter() {
            assert_eq!(region.count(), attached[rid.0], "{rid} count mismatch");
            let sticky_or_new = region.flags().intersects(RegionFlags::STICKY | RegionFlags::LOCKED);
            assert!(region.count() >= 1 || sticky_or_new, "{rid} leaked");
        }
    }
}
