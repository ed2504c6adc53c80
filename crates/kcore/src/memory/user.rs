//! 内核按用户态的方式访问用户内存
//!
//! 逐页经由页目录翻译，遇到不存在的页或写时复制的页就像硬件一样触发相应的缺页处理，
//! 并维护访问位与脏位

use defines::{
    config::PAGE_SIZE,
    error::{errno, KResult},
};

use super::{
    pte::{PageState, Ppn, Pte, PteFlags},
    MmGuard,
};
use crate::{
    process::{Pid, ProcTable},
    Kernel,
};

impl Kernel {
    pub fn read_user(&self, pid: Pid, addr: usize, buf: &mut [u8]) -> KResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let va = addr.checked_add(done).ok_or(errno::EFAULT)?;
            let offset = va % PAGE_SIZE;
            let len = (PAGE_SIZE - offset).min(buf.len() - done);
            let mut procs = self.procs.lock();
            let mut mm = self.lock_mm();
            let ppn = self.user_page(&mut procs, &mut mm, pid, va, false)?;
            buf[done..done + len].copy_from_slice(&mm.frames.page(ppn)[offset..offset + len]);
            done += len;
        }
        Ok(())
    }

    pub fn write_user(&self, pid: Pid, addr: usize, data: &[u8]) -> KResult<()> {
        let mut done = 0;
        while done < data.len() {
            let va = addr.checked_add(done).ok_or(errno::EFAULT)?;
            let offset = va % PAGE_SIZE;
            let len = (PAGE_SIZE - offset).min(data.len() - done);
            let mut procs = self.procs.lock();
            let mut mm = self.lock_mm();
            let ppn = self.user_page(&mut procs, &mut mm, pid, va, true)?;
            mm.frames.page_mut(ppn)[offset..offset + len].copy_from_slice(&data[done..done + len]);
            done += len;
        }
        Ok(())
    }

    /// 让 `va` 所在的页可以按要求访问，返回其页帧
    fn user_page(
        &self,
        procs: &mut ProcTable,
        mm: &mut MmGuard<'_>,
        pid: Pid,
        va: usize,
        write: bool,
    ) -> KResult<Ppn> {
        loop {
            let (rid, slot) = procs
                .proc(pid)?
                .space
                .translate(va)
                .ok_or(errno::EFAULT)?;
            let pte = mm.regions.get(rid).pte(slot);
            match pte.state {
                PageState::Present { ppn, .. } if !write || pte.is_writable() => {
                    let mut flags = pte.flags | PteFlags::ACCESSED;
                    flags.set(PteFlags::DIRTY, write || pte.flags.contains(PteFlags::DIRTY));
                    mm.regions.get_mut(rid).set_pte(slot, Pte::new(pte.state, flags));
                    mm.frames.touch(ppn);
                    return Ok(ppn);
                }
                PageState::Present { .. } => self.pfault_locked(procs, mm, pid, va)?,
                _ => self.vfault_locked(procs, mm, pid, va)?,
            }
        }
    }
}
