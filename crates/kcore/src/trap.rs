//! 陷入
//!
//! 目前只处理缺页异常，按错误码分派给 [`Kernel::vfault`] 或 [`Kernel::pfault`]

use core::fmt;

use bitflags::bitflags;
use defines::{
    error::{errno, KResult},
    signal::Signal,
};

use crate::{process::WaitStatus, Kernel};

/// 陷入时保存的寄存器
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
    pub cs: u16,
    pub ss: u16,
}

impl fmt::Display for TrapFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "eax={:#010x} ebx={:#010x} ecx={:#010x} edx={:#010x}",
            self.eax, self.ebx, self.ecx, self.edx
        )?;
        writeln!(
            f,
            "esi={:#010x} edi={:#010x} ebp={:#010x} esp={:#010x}",
            self.esi, self.edi, self.ebp, self.esp
        )?;
        write!(
            f,
            "eip={:#010x} eflags={:#010x} cs={:#06x} ss={:#06x}",
            self.eip, self.eflags, self.cs, self.ss
        )
    }
}

bitflags! {
    /// 缺页异常的错误码
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FaultCode: u32 {
        /// 页存在，违反了保护；否则是页不存在
        const PROTECTION = 1 << 0;
        const WRITE = 1 << 1;
        /// 发生在用户态
        const USER = 1 << 2;
    }
}

impl Kernel {
    /// 处理当前进程在 `addr` 处的缺页异常。
    ///
    /// 用户态无法修复的缺页向进程发送 `SIGSEGV`，进程随即终止，返回 `EFAULT`；
    /// `ERESTART` 表示当前线程已经睡眠，应当重新执行触发缺页的指令
    ///
    /// # Panics
    ///
    /// 内核态无法修复的缺页
    pub fn page_fault(&self, frame: &TrapFrame, addr: usize, code: FaultCode) -> KResult<()> {
        let pid = self.current_pid();
        let res = if !code.contains(FaultCode::PROTECTION) {
            self.vfault(pid, addr)
        } else if code.contains(FaultCode::WRITE) {
            self.pfault(pid, addr)
        } else {
            Err(errno::EFAULT)
        };
        let err = match res {
            Ok(()) => return Ok(()),
            Err(errno::ERESTART) => return Err(errno::ERESTART),
            Err(err) => err,
        };

        if !code.contains(FaultCode::USER) {
            error!("unresolved page fault in kernel at {addr:#x} ({code:?}): {err}\n{frame}");
            panic!("kernel page fault at {addr:#x}\n{frame}");
        }
        warn!("process {pid} faults at {addr:#x} ({code:?}): {err}");
        self.sndsig(pid, Signal::SIGSEGV)?;
        // 处理函数也救不回来，重新执行只会再次缺页
        self.exit_with(pid, WaitStatus::signaled(Signal::SIGSEGV, true))?;
        Err(errno::EFAULT)
    }
}
