//! 调度
//!
//! 单核（[`up`]）以线程为单位挑选老化计数器最大的就绪线程；多核（[`smp`]）只有主核调度，
//! 以进程为单位挑选，再把该进程的就绪线程分派到各个核上。
//! 两者都是非抢占的：只有时钟周期耗尽时间片，或者线程主动让出、睡眠时才会重新调度

mod smp;
mod up;

use defines::{config::MASTER_CORE, signal::Signal};
use smallvec::SmallVec;

pub use self::smp::Dispatch;
use crate::{
    process::{Pid, ProcTable},
    thread::{ThreadState, Tid},
    Kernel,
};

impl Kernel {
    /// 主核上的当前线程主动让出，返回接下来运行的线程
    pub fn yield_now(&self) -> Tid {
        let mut procs = self.procs.lock();
        self.reschedule(&mut procs);
        procs.current(MASTER_CORE)
    }

    /// 时钟中断。所有页帧变老，到期的闹钟发出 `SIGALRM`，当前线程的时间片减一，耗尽时重新调度。
    ///
    /// 返回是否发生了调度
    pub fn tick(&self) -> bool {
        let mut procs = self.procs.lock();
        procs.clock += 1;
        self.frames.lock().age_all();
        procs.sweep_alarms();
        let tid = procs.current(MASTER_CORE);
        if tid == Tid::IDLE {
            let runnable = procs
                .threads()
                .any(|t| t.tid() != Tid::IDLE && t.state() == ThreadState::Ready);
            if runnable {
                self.reschedule(&mut procs);
            }
            return runnable;
        }
        let thread = procs.thread_mut(tid);
        thread.counter -= 1;
        let expired = thread.counter <= 0;
        let pid = thread.pid();
        if let Ok(proc) = procs.proc_mut(pid) {
            proc.counter -= 1;
        }
        if expired {
            trace!("thread {tid} used up its quantum");
            self.reschedule(&mut procs);
        }
        expired
    }

    /// 按配置选择单核或多核调度
    pub(crate) fn reschedule(&self, procs: &mut ProcTable) {
        if self.harts.cores() > 1 {
            self.yield_smp_locked(procs);
        } else {
            procs.schedule_up();
        }
    }
}

impl ProcTable {
    /// 到期的闹钟变为 `SIGALRM`
    pub(crate) fn sweep_alarms(&mut self) {
        let clock = self.clock;
        let mut expired: SmallVec<[Pid; 4]> = SmallVec::new();
        for proc in self.procs_mut() {
            if proc.alarm.is_some_and(|at| at <= clock) {
                proc.alarm = None;
                expired.push(proc.pid());
            }
        }
        for pid in expired {
            if let Err(e) = self.post_signal(pid, Signal::SIGALRM) {
                warn!("alarm of process {pid} lost: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use defines::config::QUANTUM;

    use super::*;
    use crate::{
        process::Credentials,
        test_utils::{boot, kernel},
    };

    #[test]
    fn quantum_expiry_preempts() {
        let k = kernel();
        let a = boot(&k);
        let b = k.create_process("b", Credentials::ROOT).unwrap();
        for _ in 1..QUANTUM {
            assert!(!k.tick());
            assert_eq!(k.current_pid(), a);
        }
        assert!(k.tick());
        assert_eq!(k.current_pid(), b);
    }

    #[test]
    fn expired_alarm_posts_sigalrm() {
        let k = kernel();
        let pid = boot(&k);
        k.alarm(pid, 2).unwrap();
        k.tick();
        assert!(!k.procs.lock().proc(pid).unwrap().pending().has(Signal::SIGALRM));
        k.tick();
        assert!(k.procs.lock().proc(pid).unwrap().pending().has(Signal::SIGALRM));
        assert_eq!(k.issig(pid), Ok(Some(Signal::SIGALRM)));
    }

    #[test]
    fn idle_picks_up_new_work_on_tick() {
        let k = kernel();
        assert!(!k.tick());
        let pid = k.create_process("init", Credentials::ROOT).unwrap();
        assert!(k.tick());
        assert_eq!(k.current_pid(), pid);
    }
}
