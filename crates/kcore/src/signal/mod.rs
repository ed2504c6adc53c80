//! 信号
//!
//! 信号由进程持有：handler 表与待处理信号集都在进程上。`sndsig` 只负责挂起信号并把可中断睡眠的线程唤醒，
//! 真正的处理发生在目标进程自己调用 `issig`/`psig` 时
//!
//! 参考：<https://man7.org/linux/man-pages/man7/signal.7.html>

mod handlers;

use defines::{
    error::{errno, KResult},
    signal::{KSignalAction, KSignalSet, Signal, SignalActionFlags},
};
use extend::ext;
use smallvec::SmallVec;

pub use self::handlers::{DefaultHandler, SignalHandlers};
use crate::{
    process::{Pid, ProcTable, ProcessState, WaitStatus},
    sleep::ChainId,
    thread::ThreadState,
    Kernel,
};

#[ext]
pub impl KSignalSet {
    /// 其中能让可中断睡眠提前返回的信号：被捕获的，以及默认动作会终止或停止进程的
    fn interrupting(self, handlers: &SignalHandlers) -> KSignalSet {
        let mut rest = self;
        let mut interrupting = KSignalSet::empty();
        while let Some(signal) = rest.first_pending() {
            rest.remove(signal.into());
            let action = handlers.action(signal);
            let interrupts = if action.is_caught() {
                true
            } else if action.is_ignore() {
                false
            } else {
                !matches!(
                    DefaultHandler::new(signal),
                    DefaultHandler::Ignore | DefaultHandler::Continue
                )
            };
            if interrupts {
                interrupting |= signal.into();
            }
        }
        interrupting
    }
}

/// `psig` 对信号采取的动作
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalOutcome {
    /// 返回用户态时应跳转到的 handler
    Handler { signal: Signal, handler: usize },
    /// 进程已被终止
    Terminated(WaitStatus),
    Ignored,
}

impl Kernel {
    /// 向进程发送信号
    pub fn sndsig(&self, pid: Pid, signal: Signal) -> KResult<()> {
        self.procs.lock().post_signal(pid, signal)
    }

    /// `kill` 系统调用：只有 root 或者同一用户才能发送信号
    pub fn kill(&self, from: Pid, to: Pid, signal: Signal) -> KResult<()> {
        let mut procs = self.procs.lock();
        let sender = procs.proc(from)?.creds;
        let target = procs.proc(to)?.creds;
        if !sender.is_root() && sender.euid != target.uid && sender.uid != target.uid {
            return Err(errno::EPERM);
        }
        procs.post_signal(to, signal)
    }

    /// 安装 handler，返回旧的
    pub fn set_handler(
        &self,
        pid: Pid,
        signal: Signal,
        action: KSignalAction,
    ) -> KResult<KSignalAction> {
        if signal.is_uncatchable() && !action.is_default() {
            return Err(errno::EINVAL);
        }
        let mut procs = self.procs.lock();
        let proc = procs.proc_mut(pid)?;
        if action.is_ignore() && !matches!(signal, Signal::SIGCHLD | Signal::SIGCONT) {
            proc.pending.remove(signal.into());
        }
        Ok(core::mem::replace(
            proc.handlers.action_mut(signal),
            action,
        ))
    }

    /// 由目标进程自己在检查点调用，返回下一个需要 `psig` 处理的信号。
    ///
    /// `SIGCONT` 最先处理；忽略 `SIGCHLD` 的进程在这里直接回收僵尸子进程；默认动作为停止的信号在这里就地停止进程
    pub fn issig(&self, pid: Pid) -> KResult<Option<Signal>> {
        let mut procs = self.procs.lock();
        let mut stopped = false;
        let found = loop {
            let proc = procs.proc_mut(pid)?;
            if proc.pending.has(Signal::SIGCONT)
                && !proc.handlers.action(Signal::SIGCONT).is_caught()
            {
                proc.pending.remove(KSignalSet::SIGCONT);
                procs.resume(pid)?;
                continue;
            }
            let Some(signal) = proc.pending.first_pending() else {
                break None;
            };
            let action = proc.handlers.action(signal);
            if signal == Signal::SIGCHLD && action.is_ignore() {
                proc.pending.remove(KSignalSet::SIGCHLD);
                procs.reap_zombies(pid);
                continue;
            }
            let default = DefaultHandler::new(signal);
            if action.is_ignore()
                || (action.is_default()
                    && matches!(default, DefaultHandler::Ignore | DefaultHandler::Continue))
            {
                proc.pending.remove(signal.into());
                continue;
            }
            if action.is_default() && default == DefaultHandler::Stop {
                proc.pending.remove(signal.into());
                stopped |= procs.stop(pid)?;
                break None;
            }
            break Some(signal);
        };
        if stopped {
            self.reschedule(&mut procs);
        }
        Ok(found)
    }

    /// 执行信号的动作：跳转到 handler，或者按默认动作终止进程
    pub fn psig(&self, pid: Pid, signal: Signal) -> KResult<SignalOutcome> {
        let mut procs = self.procs.lock();
        let proc = procs.proc_mut(pid)?;
        proc.pending.remove(signal.into());
        let action = proc.handlers.action_mut(signal);
        if action.is_caught() {
            let handler = action.handler;
            if action.flags.contains(SignalActionFlags::SA_RESETHAND) {
                *action = KSignalAction::new();
            }
            return Ok(SignalOutcome::Handler { signal, handler });
        }
        if action.is_ignore() {
            return Ok(SignalOutcome::Ignored);
        }
        let status = match DefaultHandler::new(signal) {
            DefaultHandler::Terminate => WaitStatus::signaled(signal, false),
            DefaultHandler::CoreDump => WaitStatus::signaled(signal, true),
            DefaultHandler::Ignore | DefaultHandler::Continue | DefaultHandler::Stop => {
                return Ok(SignalOutcome::Ignored)
            }
        };
        let mut mm = self.lock_mm();
        self.exit_locked(&mut procs, &mut mm, pid, status)?;
        Ok(SignalOutcome::Terminated(status))
    }
}

impl ProcTable {
    /// `sndsig` 的实现。被忽略的信号直接丢弃，但 `SIGCHLD` 与 `SIGCONT` 总是挂起
    pub(crate) fn post_signal(&mut self, pid: Pid, signal: Signal) -> KResult<()> {
        let proc = self.proc_mut(pid)?;
        if proc.state == ProcessState::Zombie {
            return Ok(());
        }
        if proc.handlers.action(signal).is_ignore()
            && !matches!(signal, Signal::SIGCHLD | Signal::SIGCONT)
        {
            trace!("process {pid} ignores {signal:?}");
            return Ok(());
        }
        proc.pending |= signal.into();
        debug!("{signal:?} posted to process {pid}");
        let interrupts = !KSignalSet::from(signal)
            .interrupting(&proc.handlers)
            .is_empty();
        let threads = proc.threads.clone();
        if matches!(signal, Signal::SIGCONT | Signal::SIGKILL) {
            self.resume(pid)?;
        }
        if interrupts {
            for tid in threads {
                if self.interrupt(tid) {
                    trace!("thread {tid} is interrupted by {signal:?}");
                }
            }
        }
        Ok(())
    }

    /// 停止的进程恢复运行
    fn resume(&mut self, pid: Pid) -> KResult<()> {
        let proc = self.proc_mut(pid)?;
        if proc.state != ProcessState::Stopped {
            return Ok(());
        }
        proc.state = ProcessState::Ready;
        let threads = proc.threads.clone();
        for tid in threads {
            let thread = self.thread_mut(tid);
            if thread.state == ThreadState::Stopped {
                thread.state = ThreadState::Ready;
            }
        }
        debug!("process {pid} continues");
        Ok(())
    }

    /// 停止进程并通知父进程，返回主核上的当前线程是否因此被停下
    fn stop(&mut self, pid: Pid) -> KResult<bool> {
        let proc = self.proc_mut(pid)?;
        proc.state = ProcessState::Stopped;
        let threads = proc.threads.clone();
        let parent = proc.parent;
        let mut was_current = false;
        for tid in threads {
            let thread = self.thread_mut(tid);
            if matches!(thread.state, ThreadState::Ready | ThreadState::Running) {
                thread.state = ThreadState::Stopped;
                if let Some(hart) = thread.hart.take() {
                    was_current |= hart == defines::config::MASTER_CORE;
                    self.clear_running(hart);
                }
            }
        }
        debug!("process {pid} stopped");
        if let Some(parent) = parent {
            let notify = self.proc(parent).is_ok_and(|parent| {
                !parent
                    .handlers
                    .action(Signal::SIGCHLD)
                    .flags
                    .contains(SignalActionFlags::SA_NOCLDSTOP)
            });
            if notify {
                self.post_signal(parent, Signal::SIGCHLD)?;
                self.wakeup(ChainId::Wait(parent));
            }
        }
        Ok(was_current)
    }

    /// 忽略 `SIGCHLD` 的进程不保留僵尸子进程
    fn reap_zombies(&mut self, pid: Pid) {
        let Ok(proc) = self.proc(pid) else {
            return;
        };
        let zombies: SmallVec<[Pid; 4]> = proc
            .children
            .iter()
            .copied()
            .filter(|child| {
                self.proc(*child)
                    .is_ok_and(|child| child.state == ProcessState::Zombie)
            })
            .collect();
        for zombie in zombies {
            self.bury(zombie);
        }
    }
}
