//! 进程视角的地址空间：pregion 把 region 绑定到某个虚拟地址，页目录则把每张页表映射到 4MiB 对齐的位置
//!
//! `UPWARDS` 与普通 region 的 `addr` 是起始地址；`DOWNWARDS` 的 `addr` 是栈顶（不含），
//! region 的窗口向下延伸 `REGION_MAX_SIZE` 字节

use defines::{
    config::{
        NR_PREGIONS, PAGE_SIZE, PDES_PER_DIR, PTES_PER_TABLE, REGION_MAX_SIZE, REGION_TABLES,
        TABLE_SPAN, USER_BASE, USER_END,
    },
    error::{errno, KResult},
};

use super::{
    region::{RegionFlags, RegionId, RegionTable},
    MmGuard,
};
use crate::{
    process::{Pid, Process},
    sleep::ChainId,
    Kernel,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pregion {
    pub region: RegionId,
    pub addr: usize,
    base: usize,
}

impl Pregion {
    /// 窗口的最低地址
    pub fn base(&self) -> usize {
        self.base
    }

    pub fn contains(&self, va: usize) -> bool {
        va >= self.base && va - self.base < REGION_MAX_SIZE
    }

    /// `va` 在 region 中对应的槽
    pub fn slot(&self, va: usize) -> usize {
        (va - self.base) / PAGE_SIZE
    }
}

/// 页目录项，指向某个 region 的第 `table` 张页表
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pde {
    pub region: RegionId,
    pub table: usize,
}

pub struct AddressSpace {
    pregions: [Option<Pregion>; NR_PREGIONS],
    pdir: Box<[Option<Pde>]>,
    /// 所有 pregion 加起来的页数
    pub(crate) size: usize,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self {
            pregions: [None; NR_PREGIONS],
            pdir: vec![None; PDES_PER_DIR].into_boxed_slice(),
            size: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn pregion(&self, slot: usize) -> Option<Pregion> {
        self.pregions.get(slot).copied().flatten()
    }

    pub fn pregions(&self) -> impl Iterator<Item = (usize, Pregion)> + '_ {
        self.pregions
            .iter()
            .enumerate()
            .filter_map(|(slot, p)| p.map(|p| (slot, p)))
    }

    /// 线性查找窗口包含 `va` 的 pregion
    pub fn find(&self, va: usize) -> Option<Pregion> {
        self.pregions().map(|(_, p)| p).find(|p| p.contains(va))
    }

    /// 经由页目录找到 `va` 所在的 region 与槽
    pub fn translate(&self, va: usize) -> Option<(RegionId, usize)> {
        let pde = self.pde(va)?;
        let slot = pde.table * PTES_PER_TABLE + (va % TABLE_SPAN) / PAGE_SIZE;
        Some((pde.region, slot))
    }

    pub fn pde(&self, va: usize) -> Option<Pde> {
        self.pdir.get(va / TABLE_SPAN).copied().flatten()
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// region 在 `addr` 处挂载时窗口的最低地址
fn window_base(addr: usize, flags: RegionFlags) -> Option<usize> {
    if flags.contains(RegionFlags::DOWNWARDS) {
        addr.checked_sub(REGION_MAX_SIZE)
    } else {
        Some(addr)
    }
}

impl Kernel {
    /// 将 region 挂到进程的第 `slot` 个 pregion 上
    pub fn attachreg(&self, pid: Pid, slot: usize, addr: usize, rid: RegionId) -> KResult<()> {
        let mut procs = self.procs.lock();
        let mut regions = self.regions.lock();
        let proc = procs.proc_mut(pid)?;
        self.attach_locked(proc, &mut regions, slot, addr, rid)
    }

    /// 卸下第 `slot` 个 pregion，region 无人引用时随之释放
    pub fn detachreg(&self, pid: Pid, slot: usize) -> KResult<()> {
        let mut procs = self.procs.lock();
        let mut mm = self.lock_mm();
        let freed = Self::detach_locked(&mut procs.proc_mut(pid)?.space, &mut mm, slot)?;
        if let Some(rid) = freed {
            procs.wakeup(ChainId::Region(rid));
        }
        Ok(())
    }

    pub(crate) fn attach_locked(
        &self,
        proc: &mut Process,
        regions: &mut RegionTable,
        slot: usize,
        addr: usize,
        rid: RegionId,
    ) -> KResult<()> {
        if slot >= NR_PREGIONS {
            return Err(errno::EINVAL);
        }
        if proc.space.pregions[slot].is_some() {
            return Err(errno::EEXIST);
        }
        let region = regions.live(rid)?;
        if addr % TABLE_SPAN != 0 {
            return Err(errno::EINVAL);
        }
        let base = window_base(addr, region.flags()).ok_or(errno::EINVAL)?;
        match base.checked_add(REGION_MAX_SIZE) {
            Some(end) if base >= USER_BASE && end <= USER_END => {}
            _ => return Err(errno::EINVAL),
        }
        let first = base / TABLE_SPAN;
        let pdes = first..first + REGION_TABLES;
        if proc.space.pdir[pdes.clone()].iter().any(Option::is_some) {
            return Err(errno::EEXIST);
        }
        let pages = region.pages();
        if proc.space.size + pages > self.config.max_proc_pages {
            return Err(errno::ENOMEM);
        }
        if region.is_shared() {
            if !region.access().permits(&proc.creds) {
                return Err(errno::EACCES);
            }
        } else if region.count() > 0 {
            // 私有 region 挂两次会破坏写时复制的计数
            return Err(errno::EEXIST);
        }

        for (table, pde) in pdes.enumerate() {
            proc.space.pdir[pde] = Some(Pde { region: rid, table });
        }
        proc.space.pregions[slot] = Some(Pregion {
            region: rid,
            addr,
            base,
        });
        proc.space.size += pages;
        regions.get_mut(rid).inc_count();
        debug!("attach {rid} to process {} at {addr:#x}", proc.pid());
        Ok(())
    }

    /// 返回因此被释放的 region
    pub(crate) fn detach_locked(
        space: &mut AddressSpace,
        mm: &mut MmGuard<'_>,
        slot: usize,
    ) -> KResult<Option<RegionId>> {
        let pregion = space
            .pregions
            .get_mut(slot)
            .and_then(Option::take)
            .ok_or(errno::EINVAL)?;
        let rid = pregion.region;
        for pde in space.pdir.iter_mut() {
            if pde.is_some_and(|pde| pde.region == rid) {
                *pde = None;
            }
        }
        let region = mm.regions.get_mut(rid);
        space.size -= region.pages();
        // 同一共享 region 可能挂在多个槽上，页目录要按剩下的槽重建
        let remaining: Vec<usize> = space
            .pregions()
            .filter(|(_, other)| other.region == rid)
            .map(|(_, other)| other.base / TABLE_SPAN)
            .collect();
        for first in remaining {
            for table in 0..REGION_TABLES {
                space.pdir[first + table] = Some(Pde { region: rid, table });
            }
        }
        if region.dec_count() > 0 || region.flags().contains(RegionFlags::STICKY) {
            if region.count() == 0 {
                mm.regions.free(rid, &mut mm.frames, &mut mm.swap);
            }
            return Ok(None);
        }
        mm.regions.free(rid, &mut mm.frames, &mut mm.swap);
        Ok(Some(rid))
    }
}
