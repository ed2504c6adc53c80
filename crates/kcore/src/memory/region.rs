//! region 表
//!
//! region 是可共享内存的单位，固定大小的表中每一项要么空闲（`FREE`），要么至少被一个 pregion 引用
//! （`STICKY` 的 region 可以在无人引用时保留内容）。
//!
//! 每个 region 最多拥有 `REGION_TABLES` 张页表，页表按需分配。`UPWARDS` 的 region 从页表数组的开头编号，
//! `DOWNWARDS` 的 region（栈）从末尾编号，因此逻辑页 `n` 对应的槽分别是 `n` 和 `TOTAL_PAGES - 1 - n`

use std::{ops::Range, sync::Arc};

use bitflags::bitflags;
use defines::{
    config::{NR_REGIONS, PAGE_SIZE, PTES_PER_TABLE, REGION_TABLES},
    error::{errno, KResult},
};
use derive_more::Display;

use super::{
    frame::FrameTable,
    pte::{PageState, PageTable, Pte, PteFlags},
    swap::SwapTable,
};
use crate::{fs::Inode, process::Credentials, thread::Tid};

/// 一个 region 能容纳的页数
pub const TOTAL_PAGES: usize = REGION_TABLES * PTES_PER_TABLE;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("region#{_0}")]
pub struct RegionId(pub usize);

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        const FREE = 1 << 0;
        /// 真正共享，fork 时不复制
        const SHARED = 1 << 1;
        /// 睡眠锁被持有
        const LOCKED = 1 << 2;
        /// 引用归零时保留内容
        const STICKY = 1 << 3;
        /// 向低地址增长，如栈
        const DOWNWARDS = 1 << 4;
        /// 向高地址增长，如堆
        const UPWARDS = 1 << 5;
    }
}

/// 映射文件的一段作为 region 的初始内容
#[derive(Clone)]
pub struct Backing {
    pub inode: Arc<dyn Inode>,
    /// 文件内的字节偏移
    pub offset: usize,
    /// 映射的字节数，之后的部分按需清零
    pub size: usize,
}

/// 创建者与当前属主，以及类似文件权限的 `mode`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegionAccess {
    pub mode: u16,
    pub cuid: u32,
    pub cgid: u32,
    pub uid: u32,
    pub gid: u32,
}

impl RegionAccess {
    pub fn new(mode: u16, creds: &Credentials) -> Self {
        Self {
            mode,
            cuid: creds.euid,
            cgid: creds.egid,
            uid: creds.euid,
            gid: creds.egid,
        }
    }

    /// 是否至少有读或写权限
    pub fn permits(&self, creds: &Credentials) -> bool {
        if creds.euid == 0 {
            return true;
        }
        let bits = if creds.euid == self.uid || creds.euid == self.cuid {
            self.mode >> 6
        } else if creds.egid == self.gid || creds.egid == self.cgid {
            self.mode >> 3
        } else {
            self.mode
        };
        bits & 0o6 != 0
    }

    /// 页是否可写由 mode 中是否有任何写权限决定
    pub fn writable(&self) -> bool {
        self.mode & 0o222 != 0
    }
}

pub struct Region {
    flags: RegionFlags,
    count: usize,
    /// 字节数，总是页对齐
    size: usize,
    tables: [Option<Box<PageTable>>; REGION_TABLES],
    backing: Option<Backing>,
    access: RegionAccess,
    holder: Option<Tid>,
}

impl Region {
    fn free() -> Self {
        Self {
            flags: RegionFlags::FREE,
            count: 0,
            size: 0,
            tables: core::array::from_fn(|_| None),
            backing: None,
            access: RegionAccess::default(),
            holder: None,
        }
    }

    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn pages(&self) -> usize {
        self.size / PAGE_SIZE
    }

    pub fn access(&self) -> &RegionAccess {
        &self.access
    }

    pub fn backing(&self) -> Option<&Backing> {
        self.backing.as_ref()
    }

    pub fn holder(&self) -> Option<Tid> {
        self.holder
    }

    pub fn is_free(&self) -> bool {
        self.flags.contains(RegionFlags::FREE)
    }

    pub fn is_shared(&self) -> bool {
        self.flags.contains(RegionFlags::SHARED)
    }

    pub fn is_downwards(&self) -> bool {
        self.flags.contains(RegionFlags::DOWNWARDS)
    }

    pub fn is_growable(&self) -> bool {
        self.flags
            .intersects(RegionFlags::DOWNWARDS | RegionFlags::UPWARDS)
    }

    pub(crate) fn inc_count(&mut self) {
        self.count += 1;
    }

    pub(crate) fn dec_count(&mut self) -> usize {
        assert!(self.count > 0, "region reference count underflow");
        self.count -= 1;
        self.count
    }

    /// 逻辑页号对应的槽
    pub fn slot_of(&self, page: usize) -> usize {
        if self.is_downwards() {
            TOTAL_PAGES - 1 - page
        } else {
            page
        }
    }

    pub fn page_of(&self, slot: usize) -> usize {
        self.slot_of(slot)
    }

    /// 该槽是否在 region 当前的范围内
    pub fn in_use(&self, slot: usize) -> bool {
        slot < TOTAL_PAGES && self.page_of(slot) < self.pages()
    }

    pub fn pte(&self, slot: usize) -> Pte {
        match &self.tables[slot / PTES_PER_TABLE] {
            Some(table) => table.get(slot % PTES_PER_TABLE),
            None => Pte::ABSENT,
        }
    }

    pub fn set_pte(&mut self, slot: usize, pte: Pte) {
        let table = self.tables[slot / PTES_PER_TABLE].get_or_insert_with(PageTable::new);
        table.set(slot % PTES_PER_TABLE, pte);
    }

    /// 新增的逻辑页在首次访问前的样子
    fn initial_pte(&self, page: usize) -> Pte {
        let mut flags = PteFlags::USER;
        flags.set(PteFlags::WRITABLE, self.access.writable());
        let state = match &self.backing {
            Some(backing) if page * PAGE_SIZE < backing.size => PageState::DemandFill,
            _ => PageState::DemandZero,
        };
        Pte::new(state, flags)
    }

    /// 所有非空的槽
    fn used_slots(&self) -> impl Iterator<Item = (usize, Pte)> + '_ {
        self.tables
            .iter()
            .enumerate()
            .filter_map(|(t, table)| table.as_ref().map(|table| (t, table)))
            .flat_map(|(t, table)| {
                (0..PTES_PER_TABLE).map(move |i| (t * PTES_PER_TABLE + i, table.get(i)))
            })
            .filter(|(_, pte)| *pte != Pte::ABSENT)
    }
}

/// 释放一个 PTE 引用的页帧或交换槽
fn release_pte(pte: Pte, frames: &mut FrameTable, swap: &mut SwapTable) {
    match pte.state {
        PageState::Present { ppn, .. } => {
            frames.put(ppn);
        }
        PageState::Swapped { slot, .. } => {
            swap.free(slot);
        }
        _ => {}
    }
}

pub struct RegionTable {
    regions: Vec<Region>,
}

impl RegionTable {
    pub fn new() -> Self {
        Self {
            regions: (0..NR_REGIONS).map(|_| Region::free()).collect(),
        }
    }

    /// # Panics
    ///
    /// 访问一个空闲的 region 说明某处的引用已经失效
    pub fn get(&self, rid: RegionId) -> &Region {
        let region = &self.regions[rid.0];
        assert!(!region.is_free(), "{rid} is free");
        region
    }

    /// # Panics
    ///
    /// 同 [`RegionTable::get`]
    pub fn get_mut(&mut self, rid: RegionId) -> &mut Region {
        let region = &mut self.regions[rid.0];
        assert!(!region.is_free(), "{rid} is free");
        region
    }

    /// 对外接口上使用，不存在或空闲返回 `EINVAL`
    pub fn live(&self, rid: RegionId) -> KResult<&Region> {
        match self.regions.get(rid.0) {
            Some(region) if !region.is_free() => Ok(region),
            _ => Err(errno::EINVAL),
        }
    }

    pub fn live_count(&self) -> usize {
        self.regions.iter().filter(|r| !r.is_free()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RegionId, &Region)> + '_ {
        self.regions
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.is_free())
            .map(|(i, r)| (RegionId(i), r))
    }

    /// 分配一个 `size` 字节的 region，返回时已被 `holder` 锁住
    pub fn alloc(
        &mut self,
        access: RegionAccess,
        size: usize,
        flags: RegionFlags,
        backing: Option<Backing>,
        holder: Tid,
    ) -> KResult<RegionId> {
        let pages = size.div_ceil(PAGE_SIZE);
        if pages > TOTAL_PAGES {
            return Err(errno::ENOMEM);
        }
        let Some(idx) = self.regions.iter().position(Region::is_free) else {
            warn!("region table is full");
            return Err(errno::EAGAIN);
        };
        let region = &mut self.regions[idx];
        region.flags = (flags - RegionFlags::FREE) | RegionFlags::LOCKED;
        region.count = 0;
        region.size = pages * PAGE_SIZE;
        region.backing = backing;
        region.access = access;
        region.holder = Some(holder);
        for page in 0..pages {
            let slot = region.slot_of(page);
            let pte = region.initial_pte(page);
            region.set_pte(slot, pte);
        }
        let rid = RegionId(idx);
        debug!("allocate {rid} with {pages} pages, flags {:?}", region.flags);
        Ok(rid)
    }

    /// 复制 region。共享的 region 直接返回自身；私有的则分配新 region 并与原 region 链接同样的页帧，
    /// 原本可写的页在双方都变为只读加写时复制
    pub fn dup(
        &mut self,
        src: RegionId,
        holder: Tid,
        frames: &mut FrameTable,
        swap: &mut SwapTable,
    ) -> KResult<RegionId> {
        let source = self.live(src)?;
        if source.is_shared() {
            return Ok(src);
        }
        let (access, flags, backing, size) = (
            source.access,
            source.flags - RegionFlags::LOCKED,
            source.backing.clone(),
            source.size,
        );
        let dst = self.alloc(access, 0, flags, backing, holder)?;
        let linked: Vec<(usize, Pte)> = self.get(src).used_slots().collect();
        for (slot, pte) in linked {
            let shared = match pte.state {
                PageState::Present { ppn, cow } => {
                    frames.dup(ppn);
                    let cow = cow || pte.is_writable();
                    Pte::new(PageState::Present { ppn, cow }, pte.flags - PteFlags::WRITABLE)
                }
                PageState::Swapped { slot, cow } => {
                    swap.dup(slot);
                    let cow = cow || pte.is_writable();
                    Pte::new(PageState::Swapped { slot, cow }, pte.flags - PteFlags::WRITABLE)
                }
                _ => pte,
            };
            self.get_mut(src).set_pte(slot, shared);
            self.get_mut(dst).set_pte(slot, shared);
        }
        self.get_mut(dst).size = size;
        debug!("duplicate {src} as {dst}");
        Ok(dst)
    }

    /// 调整为 `pages` 页。增长的部分按需清零或填充，缩小的部分立即释放
    pub fn resize(
        &mut self,
        rid: RegionId,
        pages: usize,
        frames: &mut FrameTable,
        swap: &mut SwapTable,
    ) -> KResult<()> {
        if pages > TOTAL_PAGES {
            return Err(errno::ENOMEM);
        }
        let old = self.get(rid).pages();
        if pages > old {
            let region = self.get_mut(rid);
            for page in old..pages {
                let slot = region.slot_of(page);
                let pte = region.initial_pte(page);
                region.set_pte(slot, pte);
            }
        } else {
            self.release_pages(rid, pages..old, frames, swap);
        }
        self.get_mut(rid).size = pages * PAGE_SIZE;
        Ok(())
    }

    /// 释放一段逻辑页。对 `DOWNWARDS` 的 region 而言逻辑页号越大地址越低
    pub fn release_pages(
        &mut self,
        rid: RegionId,
        pages: Range<usize>,
        frames: &mut FrameTable,
        swap: &mut SwapTable,
    ) {
        let region = self.get_mut(rid);
        for page in pages {
            let slot = region.slot_of(page);
            release_pte(region.pte(slot), frames, swap);
            region.set_pte(slot, Pte::ABSENT);
        }
        for table in &mut region.tables {
            if table.as_ref().is_some_and(|t| t.is_empty()) {
                *table = None;
            }
        }
    }

    /// 释放 region 的全部页并将其标记为空闲。`STICKY` 的 region 保留内容，仅释放锁
    ///
    /// # Panics
    ///
    /// 仍被引用或已经空闲的 region 不能被释放
    pub fn free(&mut self, rid: RegionId, frames: &mut FrameTable, swap: &mut SwapTable) {
        let region = self.get_mut(rid);
        assert_eq!(region.count, 0, "freeing {rid} which is still attached");
        region.holder = None;
        region.flags -= RegionFlags::LOCKED;
        if region.flags.contains(RegionFlags::STICKY) {
            debug!("{rid} is sticky, keep its pages");
            return;
        }
        let slots: Vec<Pte> = region.used_slots().map(|(_, pte)| pte).collect();
        for pte in slots {
            release_pte(pte, frames, swap);
        }
        *region = Region::free();
        debug!("free {rid}");
    }

    /// 清除 `STICKY`，若此时无人引用则一并释放
    pub fn unstick(&mut self, rid: RegionId, frames: &mut FrameTable, swap: &mut SwapTable) {
        let region = self.get_mut(rid);
        region.flags -= RegionFlags::STICKY;
        if region.count == 0 {
            self.free(rid, frames, swap);
        }
    }

    /// 尝试获取睡眠锁。成功返回 `true`，被别的线程持有返回 `false`
    ///
    /// # Panics
    ///
    /// 锁不可重入，同一线程重复加锁是致命错误
    pub fn try_lock(&mut self, rid: RegionId, tid: Tid) -> KResult<bool> {
        let region = self.regions.get_mut(rid.0).ok_or(errno::EINVAL)?;
        if region.is_free() {
            return Err(errno::EINVAL);
        }
        match region.holder {
            None => {
                region.holder = Some(tid);
                region.flags |= RegionFlags::LOCKED;
                Ok(true)
            }
            Some(holder) if holder == tid => panic!("{rid} locked twice by thread {tid}"),
            Some(_) => Ok(false),
        }
    }

    /// 释放睡眠锁。region 已被释放时什么也不做
    pub fn unlock(&mut self, rid: RegionId, tid: Tid) {
        let region = &mut self.regions[rid.0];
        if region.is_free() || region.holder.is_none() {
            return;
        }
        assert_eq!(region.holder, Some(tid), "{rid} unlocked by a non-holder");
        region.holder = None;
        region.flags -= RegionFlags::LOCKED;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Pid;

    fn tables() -> (RegionTable, FrameTable, SwapTable) {
        (RegionTable::new(), FrameTable::new(16), SwapTable::new(16))
    }

    fn rw() -> RegionAccess {
        RegionAccess::new(0o600, &Credentials::ROOT)
    }

    #[test]
    fn region_table_exhaustion() {
        let (mut regions, ..) = tables();
        for i in 0..NR_REGIONS {
            assert_eq!(
                regions.alloc(rw(), PAGE_SIZE, RegionFlags::UPWARDS, None, Tid(0)),
                Ok(RegionId(i))
            );
        }
        assert_eq!(
            regions.alloc(rw(), PAGE_SIZE, RegionFlags::UPWARDS, None, Tid(0)),
            Err(errno::EAGAIN)
        );
        assert_eq!(regions.live_count(), NR_REGIONS);
    }

    #[test]
    fn oversized_region_is_rejected() {
        let (mut regions, ..) = tables();
        let size = (TOTAL_PAGES + 1) * PAGE_SIZE;
        assert_eq!(
            regions.alloc(rw(), size, RegionFlags::UPWARDS, None, Tid(0)),
            Err(errno::ENOMEM)
        );
    }

    #[test]
    fn new_region_is_locked_and_demand_zero() {
        let (mut regions, ..) = tables();
        let rid = regions
            .alloc(rw(), PAGE_SIZE + 1, RegionFlags::UPWARDS, None, Tid(3))
            .unwrap();
        let region = regions.get(rid);
        assert_eq!(region.pages(), 2);
        assert_eq!(region.holder(), Some(Tid(3)));
        assert!(region.flags().contains(RegionFlags::LOCKED));
        assert_eq!(region.pte(1).state, PageState::DemandZero);
        assert!(region.pte(1).is_writable());
        assert_eq!(region.pte(2), Pte::ABSENT);
    }

    #[test]
    fn downwards_region_indexes_from_the_end() {
        let (mut regions, mut frames, mut swap) = tables();
        let rid = regions
            .alloc(rw(), 2 * PAGE_SIZE, RegionFlags::DOWNWARDS, None, Tid(0))
            .unwrap();
        assert_eq!(regions.get(rid).pte(TOTAL_PAGES - 1).state, PageState::DemandZero);
        assert_eq!(regions.get(rid).pte(TOTAL_PAGES - 2).state, PageState::DemandZero);
        assert_eq!(regions.get(rid).pte(0), Pte::ABSENT);

        let ppn = frames.alloc(Pid(1), 0).unwrap();
        let pte = Pte::new(PageState::Present { ppn, cow: false }, PteFlags::USER);
        regions.get_mut(rid).set_pte(TOTAL_PAGES - 2, pte);
        // 缩小时释放低地址（逻辑页号大）的一端
        regions.resize(rid, 1, &mut frames, &mut swap).unwrap();
        assert_eq!(frames.count(ppn), 0);
        assert!(regions.get(rid).in_use(TOTAL_PAGES - 1));
        assert!(!regions.get(rid).in_use(TOTAL_PAGES - 2));
    }

    #[test]
    fn private_dup_links_pages_copy_on_write() {
        let (mut regions, mut frames, mut swap) = tables();
        let src = regions
            .alloc(rw(), 2 * PAGE_SIZE, RegionFlags::UPWARDS, None, Tid(0))
            .unwrap();
        let ppn = frames.alloc(Pid(1), 0).unwrap();
        let flags = PteFlags::USER | PteFlags::WRITABLE;
        regions
            .get_mut(src)
            .set_pte(0, Pte::new(PageState::Present { ppn, cow: false }, flags));

        let dst = regions.dup(src, Tid(0), &mut frames, &mut swap).unwrap();
        assert_ne!(src, dst);
        assert_eq!(frames.count(ppn), 2);
        for rid in [src, dst] {
            let pte = regions.get(rid).pte(0);
            assert_eq!(pte.state, PageState::Present { ppn, cow: true });
            assert!(!pte.is_writable());
            assert_eq!(regions.get(rid).pte(1).state, PageState::DemandZero);
        }
        assert_eq!(regions.get(dst).pages(), 2);

        regions.free(dst, &mut frames, &mut swap);
        assert_eq!(frames.count(ppn), 1);
        assert!(regions.live(dst).is_err());
    }

    #[test]
    fn shared_dup_returns_same_region() {
        let (mut regions, mut frames, mut swap) = tables();
        let rid = regions
            .alloc(rw(), PAGE_SIZE, RegionFlags::SHARED, None, Tid(0))
            .unwrap();
        assert_eq!(regions.dup(rid, Tid(0), &mut frames, &mut swap), Ok(rid));
        assert_eq!(regions.live_count(), 1);
    }

    #[test]
    fn sticky_region_survives_free() {
        let (mut regions, mut frames, mut swap) = tables();
        let rid = regions
            .alloc(rw(), PAGE_SIZE, RegionFlags::STICKY | RegionFlags::UPWARDS, None, Tid(0))
            .unwrap();
        let ppn = frames.alloc(Pid(1), 0).unwrap();
        regions
            .get_mut(rid)
            .set_pte(0, Pte::new(PageState::Present { ppn, cow: false }, PteFlags::USER));
        regions.free(rid, &mut frames, &mut swap);
        assert!(regions.live(rid).is_ok());
        assert_eq!(frames.count(ppn), 1);
        assert_eq!(regions.get(rid).holder(), None);
        regions.unstick(rid, &mut frames, &mut swap);
        assert!(regions.live(rid).is_err());
        assert_eq!(frames.count(ppn), 0);
    }

    #[test]
    fn sleep_lock_is_exclusive() {
        let (mut regions, ..) = tables();
        let rid = regions
            .alloc(rw(), PAGE_SIZE, RegionFlags::UPWARDS, None, Tid(1))
            .unwrap();
        assert_eq!(regions.try_lock(rid, Tid(2)), Ok(false));
        regions.unlock(rid, Tid(1));
        assert_eq!(regions.try_lock(rid, Tid(2)), Ok(true));
        assert_eq!(regions.get(rid).holder(), Some(Tid(2)));
        assert_eq!(regions.try_lock(RegionId(5), Tid(2)), Err(errno::EINVAL));
    }

    #[test]
    fn shared_access_follows_mode() {
        let owner = Credentials::user(100, 100);
        let access = RegionAccess::new(0o640, &owner);
        assert!(access.permits(&owner));
        assert!(access.permits(&Credentials::user(101, 100)));
        assert!(!access.permits(&Credentials::user(102, 102)));
        assert!(access.permits(&Credentials::ROOT));
        assert!(!RegionAccess::new(0o444, &owner).writable());
    }
}
