//! 线程控制块
//!
//! 线程存放在进程表的 slab 中，以 [`Tid`] 作为稳定的句柄。tid 0 是 idle 线程，属于 pid 0

use defines::{
    config::{MASTER_CORE, QUANTUM},
    error::{errno, KResult},
};
use derive_more::Display;

use crate::{process::Pid, sleep::ChainId, trap::TrapFrame, Kernel};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub struct Tid(pub usize);

impl Tid {
    pub const IDLE: Tid = Tid(0);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    /// 可被信号打断的睡眠
    Waiting,
    /// 不可打断的睡眠
    Sleeping,
    Stopped,
    Dead,
}

impl ThreadState {
    pub fn is_asleep(self) -> bool {
        matches!(self, Self::Waiting | Self::Sleeping)
    }
}

/// 从核上的线程请求主核代为执行的同步调用
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncCall {
    #[default]
    None,
    /// 已提交，线程阻塞等待
    Pending,
    /// 主核已执行完，等待重新派发
    Done,
}

pub struct Thread {
    tid: Tid,
    pid: Pid,
    pub(crate) state: ThreadState,
    /// 老化计数器，越大越优先
    pub(crate) counter: i32,
    /// 睡眠时所在的链
    pub(crate) chain: Option<ChainId>,
    /// 内核线程不参与老化，也不会被派发到从核
    system: bool,
    pub context: TrapFrame,
    pub(crate) sync_call: SyncCall,
    /// 正在运行它的核
    pub(crate) hart: Option<usize>,
}

impl Thread {
    pub(crate) fn new(tid: Tid, pid: Pid, system: bool) -> Self {
        Self {
            tid,
            pid,
            state: ThreadState::Ready,
            counter: QUANTUM,
            chain: None,
            system,
            context: TrapFrame::default(),
            sync_call: SyncCall::None,
            hart: None,
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn counter(&self) -> i32 {
        self.counter
    }

    pub fn chain(&self) -> Option<ChainId> {
        self.chain
    }

    pub fn is_system(&self) -> bool {
        self.system
    }

    pub fn sync_call(&self) -> SyncCall {
        self.sync_call
    }

    pub fn hart(&self) -> Option<usize> {
        self.hart
    }
}

/// 线程的只读快照
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadInfo {
    pub pid: Pid,
    pub state: ThreadState,
    pub counter: i32,
    pub chain: Option<ChainId>,
    pub hart: Option<usize>,
    pub sync_call: SyncCall,
}

impl Kernel {
    pub fn thread_info(&self, tid: Tid) -> KResult<ThreadInfo> {
        let procs = self.procs.lock();
        let thread = procs.try_thread(tid).ok_or(errno::ESRCH)?;
        Ok(ThreadInfo {
            pid: thread.pid,
            state: thread.state,
            counter: thread.counter,
            chain: thread.chain,
            hart: thread.hart,
            sync_call: thread.sync_call,
        })
    }

    /// 运行中的线程请求主核代为执行一次同步调用，随后阻塞直到下一次主核调度时被重新派发
    pub fn sync_call(&self, tid: Tid) -> KResult<()> {
        let mut procs = self.procs.lock();
        let thread = procs.try_thread_mut(tid).ok_or(errno::ESRCH)?;
        // 主核上的线程不需要跨核调用
        if thread.state != ThreadState::Running
            || thread.sync_call != SyncCall::None
            || thread.hart == Some(MASTER_CORE)
        {
            return Err(errno::EINVAL);
        }
        thread.sync_call = SyncCall::Pending;
        thread.state = ThreadState::Sleeping;
        if let Some(hart) = thread.hart.take() {
            procs.clear_running(hart);
            self.harts.idle(hart);
        }
        trace!("thread {tid} waits for a synchronous call");
        Ok(())
    }
}
