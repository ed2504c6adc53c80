//! 睡眠与唤醒
//!
//! 睡眠链是以 [`ChainId`] 为键的线程句柄队列。新睡眠的线程放在队首，唤醒时整条链一起就绪。
//! 优先级非负为可中断睡眠（`Waiting`），睡前若已有待处理的信号则直接返回 `EINTR`；
//! 负数为不可中断睡眠（`Sleeping`）

use defines::{
    config::MASTER_CORE,
    error::{errno, KResult},
};
use derive_more::Display;
use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::{
    memory::region::RegionId,
    process::{Pid, ProcTable},
    signal::KSignalSetExt,
    thread::{ThreadState, Tid},
    Kernel,
};

/// 睡眠所等待的条件
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum ChainId {
    /// region 的睡眠锁
    #[display("{_0}")]
    Region(RegionId),
    /// 等待该进程的子进程状态变化
    #[display("wait({_0})")]
    Wait(Pid),
    /// 等待任意信号
    #[display("pause")]
    Pause,
    #[display("chain#{_0}")]
    Custom(usize),
    /// idle 线程自举时的等待，不会真正阻塞
    #[display("idle")]
    Idle,
}

#[derive(Default)]
pub struct SleepChains {
    chains: HashMap<ChainId, SmallVec<[Tid; 4]>>,
}

impl SleepChains {
    pub fn push(&mut self, chain: ChainId, tid: Tid) {
        self.chains.entry(chain).or_default().insert(0, tid);
    }

    /// 取出整条链，后睡的在前
    pub fn take(&mut self, chain: ChainId) -> SmallVec<[Tid; 4]> {
        self.chains.remove(&chain).unwrap_or_default()
    }

    pub fn remove(&mut self, chain: ChainId, tid: Tid) {
        if let Some(tids) = self.chains.get_mut(&chain) {
            tids.retain(|t| *t != tid);
            if tids.is_empty() {
                self.chains.remove(&chain);
            }
        }
    }

    pub fn contains(&self, chain: ChainId, tid: Tid) -> bool {
        self.chains.get(&chain).is_some_and(|tids| tids.contains(&tid))
    }

    pub fn len(&self, chain: ChainId) -> usize {
        self.chains.get(&chain).map_or(0, SmallVec::len)
    }
}

impl Kernel {
    /// 当前线程睡在 `chain` 上直到被唤醒
    ///
    /// 这是一个模拟：返回时调度已经发生，被唤醒的线程需要重新发起导致睡眠的操作
    pub fn sleep(&self, chain: ChainId, priority: i32) -> KResult<()> {
        let mut procs = self.procs.lock();
        self.sleep_locked(&mut procs, chain, priority)
    }

    /// 唤醒链上的所有线程，返回被唤醒的数量
    pub fn wakeup(&self, chain: ChainId) -> usize {
        self.procs.lock().wakeup(chain)
    }

    pub(crate) fn sleep_locked(
        &self,
        procs: &mut ProcTable,
        chain: ChainId,
        priority: i32,
    ) -> KResult<()> {
        let tid = procs.current(MASTER_CORE);
        if tid == Tid::IDLE || chain == ChainId::Idle {
            // idle 线程无处可切换，只能原地等待
            core::hint::spin_loop();
            return Ok(());
        }
        let pid = procs.thread(tid).pid();
        let state = if priority >= 0 {
            let proc = procs.proc(pid)?;
            if !proc.pending.interrupting(&proc.handlers).is_empty() {
                return Err(errno::EINTR);
            }
            ThreadState::Waiting
        } else {
            ThreadState::Sleeping
        };
        procs.block(tid, chain, state);
        trace!("thread {tid} sleeps on {chain} with priority {priority}");
        self.reschedule(procs);
        Ok(())
    }
}

impl ProcTable {
    /// 将链上的线程全部置为就绪。已经不在睡眠的线程（比如被信号提前唤醒）被跳过
    pub fn wakeup(&mut self, chain: ChainId) -> usize {
        let mut woken = 0;
        for tid in self.chains.take(chain) {
            let Some(thread) = self.try_thread_mut(tid) else {
                continue;
            };
            if thread.state.is_asleep() && thread.chain == Some(chain) {
                thread.state = ThreadState::Ready;
                thread.chain = None;
                woken += 1;
            }
        }
        if woken > 0 {
            trace!("wake up {woken} threads on {chain}");
        }
        woken
    }

    pub(crate) fn block(&mut self, tid: Tid, chain: ChainId, state: ThreadState) {
        let thread = self.thread_mut(tid);
        thread.state = state;
        thread.chain = Some(chain);
        self.chains.push(chain, tid);
    }

    /// 把可中断睡眠的线程从链上摘下并就绪
    pub(crate) fn interrupt(&mut self, tid: Tid) -> bool {
        let thread = self.thread_mut(tid);
        if thread.state != ThreadState::Waiting {
            return false;
        }
        thread.state = ThreadState::Ready;
        let chain = thread.chain.take();
        if let Some(chain) = chain {
            self.chains.remove(chain, tid);
        }
        true
    }

    pub fn is_sleeping_on(&self, tid: Tid, chain: ChainId) -> bool {
        self.chains.contains(chain, tid)
    }
}

#[cfg(test)]
mod tests {
    use defines::{config::PRI_PAUSE, signal::Signal};

    use super::*;
    use crate::{
        process::Credentials,
        test_utils::{boot, kernel},
    };

    #[test]
    fn chain_is_lifo() {
        let mut chains = SleepChains::default();
        chains.push(ChainId::Pause, Tid(1));
        chains.push(ChainId::Pause, Tid(2));
        chains.push(ChainId::Custom(1), Tid(3));
        assert_eq!(chains.take(ChainId::Pause).as_slice(), &[Tid(2), Tid(1)]);
        assert!(chains.take(ChainId::Pause).is_empty());
        chains.remove(ChainId::Custom(1), Tid(3));
        assert_eq!(chains.len(ChainId::Custom(1)), 0);
    }

    #[test]
    fn wakeup_readies_every_sleeper() {
        let k = kernel();
        let a = boot(&k);
        let b = k.create_process("b", Credentials::ROOT).unwrap();
        let ta = k.current();
        k.sleep(ChainId::Custom(7), PRI_PAUSE).unwrap();
        // a 睡下之后 b 被调度
        assert_eq!(k.current_pid(), b);
        let tb = k.current();
        k.sleep(ChainId::Custom(7), -1).unwrap();
        assert_eq!(k.current(), Tid::IDLE);
        assert_eq!(k.thread_info(ta).unwrap().state, ThreadState::Waiting);
        assert_eq!(k.thread_info(tb).unwrap().state, ThreadState::Sleeping);

        assert_eq!(k.wakeup(ChainId::Custom(7)), 2);
        for tid in [ta, tb] {
            let info = k.thread_info(tid).unwrap();
            assert_eq!(info.state, ThreadState::Ready);
            assert_eq!(info.chain, None);
            assert!(!k.procs.lock().is_sleeping_on(tid, ChainId::Custom(7)));
        }
        // 空链上唤醒什么也不做
        assert_eq!(k.wakeup(ChainId::Custom(7)), 0);
        k.yield_now();
        assert_eq!(k.current_pid(), a);
    }

    #[test]
    fn pending_signal_interrupts_before_sleeping() {
        let k = kernel();
        let pid = boot(&k);
        let tid = k.current();
        k.sndsig(pid, Signal::SIGUSR1).unwrap();
        assert_eq!(k.sleep(ChainId::Pause, PRI_PAUSE), Err(errno::EINTR));
        assert_eq!(k.current(), tid);
        // 不可中断睡眠不理会信号
        k.sleep(ChainId::Pause, -1).unwrap();
        assert_eq!(k.thread_info(tid).unwrap().state, ThreadState::Sleeping);
    }

    #[test]
    fn ignored_sigchld_does_not_interrupt() {
        let k = kernel();
        let pid = boot(&k);
        k.sndsig(pid, Signal::SIGCHLD).unwrap();
        k.sleep(ChainId::Pause, PRI_PAUSE).unwrap();
        assert_eq!(k.current(), Tid::IDLE);
    }

    #[test]
    fn signal_splices_waiting_thread_out_of_chain() {
        let k = kernel();
        let pid = boot(&k);
        let tid = k.current();
        k.sleep(ChainId::Pause, PRI_PAUSE).unwrap();
        k.sndsig(pid, Signal::SIGUSR1).unwrap();
        assert_eq!(k.thread_info(tid).unwrap().state, ThreadState::Ready);
        assert!(!k.procs.lock().is_sleeping_on(tid, ChainId::Pause));
    }

    #[test]
    fn idle_thread_never_blocks() {
        let k = kernel();
        assert_eq!(k.current(), Tid::IDLE);
        k.sleep(ChainId::Idle, PRI_PAUSE).unwrap();
        k.sleep(ChainId::Pause, PRI_PAUSE).unwrap();
        assert_eq!(k.thread_info(Tid::IDLE).unwrap().state, ThreadState::Running);
    }
}
