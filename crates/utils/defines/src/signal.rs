use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// 支持的信号数量（仅标准信号）
pub const NSIG: usize = 32;

pub const SIG_DFL: usize = 0;
pub const SIG_IGN: usize = 1;

/// 参考 musl 的 `k_sigaction`
#[repr(C)]
#[derive(Clone, Debug)]
pub struct KSignalAction {
    /// singal handler 的地址，或者 `SIG_DFL`/`SIG_IGN`
    pub handler: usize,
    pub flags: SignalActionFlags,
    pub restorer: usize,
    pub mask: u64,
}

impl KSignalAction {
    pub const fn new() -> Self {
        Self {
            handler: SIG_DFL,
            mask: 0,
            flags: SignalActionFlags::empty(),
            restorer: 0,
        }
    }

    pub const fn with_handler(handler: usize) -> Self {
        let mut action = Self::new();
        action.handler = handler;
        action
    }

    pub fn is_ignore(&self) -> bool {
        self.handler == SIG_IGN
    }

    pub fn is_default(&self) -> bool {
        self.handler == SIG_DFL
    }

    /// 用户注册了自己的 handler
    pub fn is_caught(&self) -> bool {
        !self.is_ignore() && !self.is_default()
    }
}

impl Default for KSignalAction {
    fn default() -> Self {
        Self::new()
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SignalActionFlags: u32 {
        const SA_NOCLDSTOP = 1;
        const SA_RESTORER = 0x04_000_000;
        /// 一般而言。执行一个 signal handler 时，会屏蔽自己这个信号。
        ///
        /// 若指定以下这个 flag 则不会。sigaction 中的 mask 仍有效
        const SA_NODEFER  = 0x40_000_000;
        const SA_RESETHAND = 0x80_000_000;
    }
}

/// POSIX 信号编号，从 1 开始
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
pub enum Signal {
    SIGHUP = 1,
    SIGINT = 2,
    SIGQUIT = 3,
    SIGILL = 4,
    SIGTRAP = 5,
    SIGABRT = 6,
    SIGBUS = 7,
    SIGFPE = 8,
    SIGKILL = 9,
    SIGUSR1 = 10,
    SIGSEGV = 11,
    SIGUSR2 = 12,
    SIGPIPE = 13,
    SIGALRM = 14,
    SIGTERM = 15,
    SIGSTKFLT = 16,
    SIGCHLD = 17,
    SIGCONT = 18,
    SIGSTOP = 19,
    SIGTSTP = 20,
    SIGTTIN = 21,
    SIGTTOU = 22,
    SIGURG = 23,
    SIGXCPU = 24,
    SIGXFSZ = 25,
    SIGVTALRM = 26,
    SIGPROF = 27,
    SIGWINCH = 28,
    SIGIO = 29,
    SIGPWR = 30,
    SIGSYS = 31,
}

impl Signal {
    pub fn from_user(signum: u8) -> Option<Signal> {
        Signal::try_from(signum).ok()
    }

    pub fn to_user(self) -> u8 {
        self.into()
    }

    /// 在 handler 表中的下标
    pub fn index(self) -> usize {
        self as usize
    }

    /// `SIGKILL` 和 `SIGSTOP` 不能被捕获或忽略
    pub fn is_uncatchable(self) -> bool {
        matches!(self, Signal::SIGKILL | Signal::SIGSTOP)
    }
}

bitflags! {
    /// 进程收到的信号集合，第 `n - 1` 位代表信号 `n`
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct KSignalSet: u32 {
        const SIGHUP    = 1 << (Signal::SIGHUP as u8 - 1);
        const SIGINT    = 1 << (Signal::SIGINT as u8 - 1);
        const SIGQUIT   = 1 << (Signal::SIGQUIT as u8 - 1);
        const SIGILL    = 1 << (Signal::SIGILL as u8 - 1);
        const SIGTRAP   = 1 << (Signal::SIGTRAP as u8 - 1);
        const SIGABRT   = 1 << (Signal::SIGABRT as u8 - 1);
        const SIGBUS    = 1 << (Signal::SIGBUS as u8 - 1);
        const SIGFPE    = 1 << (Signal::SIGFPE as u8 - 1);
        const SIGKILL   = 1 << (Signal::SIGKILL as u8 - 1);
        const SIGUSR1   = 1 << (Signal::SIGUSR1 as u8 - 1);
        const SIGSEGV   = 1 << (Signal::SIGSEGV as u8 - 1);
        const SIGUSR2   = 1 << (Signal::SIGUSR2 as u8 - 1);
        const SIGPIPE   = 1 << (Signal::SIGPIPE as u8 - 1);
        const SIGALRM   = 1 << (Signal::SIGALRM as u8 - 1);
        const SIGTERM   = 1 << (Signal::SIGTERM as u8 - 1);
        const SIGSTKFLT = 1 << (Signal::SIGSTKFLT as u8 - 1);
        const SIGCHLD   = 1 << (Signal::SIGCHLD as u8 - 1);
        const SIGCONT   = 1 << (Signal::SIGCONT as u8 - 1);
        const SIGSTOP   = 1 << (Signal::SIGSTOP as u8 - 1);
        const SIGTSTP   = 1 << (Signal::SIGTSTP as u8 - 1);
        const SIGTTIN   = 1 << (Signal::SIGTTIN as u8 - 1);
        const SIGTTOU   = 1 << (Signal::SIGTTOU as u8 - 1);
        const SIGURG    = 1 << (Signal::SIGURG as u8 - 1);
        const SIGXCPU   = 1 << (Signal::SIGXCPU as u8 - 1);
        const SIGXFSZ   = 1 << (Signal::SIGXFSZ as u8 - 1);
        const SIGVTALRM = 1 << (Signal::SIGVTALRM as u8 - 1);
        const SIGPROF   = 1 << (Signal::SIGPROF as u8 - 1);
        const SIGWINCH  = 1 << (Signal::SIGWINCH as u8 - 1);
        const SIGIO     = 1 << (Signal::SIGIO as u8 - 1);
        const SIGPWR    = 1 << (Signal::SIGPWR as u8 - 1);
        const SIGSYS    = 1 << (Signal::SIGSYS as u8 - 1);
    }
}

impl KSignalSet {
    /// 编号最小的待处理信号
    pub fn first_pending(self) -> Option<Signal> {
        if self.is_empty() {
            return None;
        }
        Signal::from_user(self.bits().trailing_zeros() as u8 + 1)
    }

    pub fn has(self, signal: Signal) -> bool {
        self.contains(signal.into())
    }
}

impl From<Signal> for KSignalSet {
    fn from(value: Signal) -> Self {
        Self::from_bits_truncate(1 << (value as u8 - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_numbers_roundtrip_through_user() {
        assert_eq!(Signal::from_user(9), Some(Signal::SIGKILL));
        assert_eq!(Signal::SIGCHLD.to_user(), 17);
        assert_eq!(Signal::from_user(0), None);
        assert_eq!(Signal::from_user(32), None);
    }

    #[test]
    fn first_pending_picks_lowest_number() {
        let set = KSignalSet::SIGTERM | KSignalSet::SIGINT | KSignalSet::SIGCHLD;
        assert_eq!(set.first_pending(), Some(Signal::SIGINT));
        assert_eq!(KSignalSet::empty().first_pending(), None);
        assert!(set.has(Signal::SIGCHLD));
        assert!(!set.has(Signal::SIGKILL));
    }
}
