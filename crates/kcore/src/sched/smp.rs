use defines::config::{HART_NUM, MASTER_CORE, QUANTUM};
use smallvec::SmallVec;

use crate::{
    process::{Pid, ProcTable, ProcessState},
    thread::{SyncCall, ThreadState, Tid},
    Kernel,
};

/// 一次多核调度的结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dispatch {
    /// 被选中的进程，没有可运行进程时为 idle
    pub process: Pid,
    pub master: Tid,
    /// 派发到从核上的线程
    pub slaves: SmallVec<[(usize, Tid); HART_NUM]>,
}

impl Kernel {
    /// 多核调度，只能由主核发起，其他核调用返回 `None`
    pub fn yield_smp(&self, hart: usize) -> Option<Dispatch> {
        if hart != MASTER_CORE {
            return None;
        }
        let mut procs = self.procs.lock();
        Some(self.yield_smp_locked(&mut procs))
    }

    /// 1. 代当前进程完成挂起的同步调用
    /// 2. 让所有从核停下，正在运行的线程回到就绪
    /// 3. 以进程为单位挑选
    /// 4. 把胜者的就绪线程依次派发到主核与从核，再把完成了同步调用的线程派发出去
    pub(crate) fn yield_smp_locked(&self, procs: &mut ProcTable) -> Dispatch {
        let current = procs.current_pid();
        let mut served: SmallVec<[Tid; 4]> = SmallVec::new();
        if let Ok(proc) = procs.proc(current) {
            served.extend(proc.threads().iter().copied());
        }
        served.retain(|tid| procs.thread(*tid).sync_call == SyncCall::Pending);
        for &tid in &served {
            procs.thread_mut(tid).sync_call = SyncCall::Done;
            trace!("synchronous call of thread {tid} served");
        }

        for hart in 1..self.harts.cores() {
            if procs.running(hart).is_some() {
                self.harts.idle(hart);
                procs.requeue(hart);
            }
        }
        procs.requeue(MASTER_CORE);
        procs.sweep_alarms();

        let mut dispatch = Dispatch {
            process: Pid::IDLE,
            master: Tid::IDLE,
            slaves: SmallVec::new(),
        };
        let mut harts = MASTER_CORE..self.harts.cores();
        let mut place = |procs: &mut ProcTable, dispatch: &mut Dispatch, tid: Tid| -> bool {
            let Some(hart) = harts.next() else {
                return false;
            };
            procs.switch_to(hart, tid);
            if hart == MASTER_CORE {
                dispatch.master = tid;
            } else {
                self.harts.schedule(hart, tid);
                dispatch.slaves.push((hart, tid));
            }
            true
        };

        if let Some(pid) = procs.pick_process() {
            dispatch.process = pid;
            let tids: SmallVec<[Tid; 4]> = procs
                .proc(pid)
                .map(|proc| proc.threads().iter().copied().collect())
                .unwrap_or_default();
            for tid in tids {
                let thread = procs.thread(tid);
                if thread.state() != ThreadState::Ready || thread.is_system() {
                    continue;
                }
                if !place(procs, &mut dispatch, tid) {
                    break;
                }
            }
        }

        let done: SmallVec<[Tid; 4]> = procs
            .threads()
            .filter(|t| t.sync_call == SyncCall::Done)
            .map(|t| t.tid())
            .collect();
        for tid in done {
            let thread = procs.thread_mut(tid);
            thread.sync_call = SyncCall::None;
            thread.state = ThreadState::Ready;
            place(procs, &mut dispatch, tid);
        }

        if dispatch.master == Tid::IDLE {
            procs.switch_to(MASTER_CORE, Tid::IDLE);
        }
        debug!(
            "dispatch process {} to {} cores",
            dispatch.process,
            usize::from(dispatch.master != Tid::IDLE) + dispatch.slaves.len()
        );
        dispatch
    }
}

impl ProcTable {
    /// 进程级的挑选，规则与单核相同：老化计数器减 nice 最大者胜出，相同时表中靠前者胜出。
    ///
    /// 只考虑至少有一个就绪用户线程的进程
    pub(crate) fn pick_process(&mut self) -> Option<Pid> {
        let mut candidates: SmallVec<[(Pid, i32); 16]> = SmallVec::new();
        for proc in self.procs() {
            if proc.pid() == Pid::IDLE || proc.is_system() || proc.state() != ProcessState::Ready
            {
                continue;
            }
            let runnable = proc.threads().iter().any(|&tid| {
                let thread = self.thread(tid);
                thread.state() == ThreadState::Ready && !thread.is_system()
            });
            if runnable {
                candidates.push((proc.pid(), proc.effective(proc.counter)));
            }
        }
        let mut best: Option<(Pid, i32)> = None;
        for &(pid, value) in &candidates {
            if best.map_or(true, |(_, best)| value > best) {
                best = Some((pid, value));
            }
        }
        let (winner, _) = best?;
        for &(pid, _) in &candidates {
            let Ok(proc) = self.proc_mut(pid) else {
                continue;
            };
            if pid == winner {
                proc.counter = QUANTUM;
            } else {
                proc.counter = proc.counter.saturating_add(1);
            }
        }
        Some(winner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        process::Credentials,
        test_utils::{boot, kernel_with},
        KernelConfig,
    };

    fn smp_kernel(cores: usize) -> Kernel {
        kernel_with(KernelConfig::default().with_cores(cores))
    }

    #[test]
    fn only_master_schedules() {
        let k = smp_kernel(2);
        boot(&k);
        assert_eq!(k.yield_smp(1), None);
    }

    #[test]
    fn threads_of_winner_spread_over_cores() {
        let k = smp_kernel(3);
        let init = boot(&k);
        let main = k.current_thread_of(init);
        let second = k.spawn_thread(init).unwrap();
        let third = k.spawn_thread(init).unwrap();
        let fourth = k.spawn_thread(init).unwrap();

        let dispatch = k.yield_smp(MASTER_CORE).unwrap();
        assert_eq!(dispatch.process, init);
        assert_eq!(dispatch.master, main);
        assert_eq!(dispatch.slaves.as_slice(), &[(1, second), (2, third)]);
        assert_eq!(k.harts.running(1), Some(second));
        assert_eq!(k.harts.running(2), Some(third));
        // 核不够时剩下的线程继续就绪
        assert_eq!(k.thread_info(fourth).unwrap().state, ThreadState::Ready);
        assert_eq!(k.thread_info(third).unwrap().hart, Some(2));
    }

    #[test]
    fn switching_process_quiesces_slaves() {
        let k = smp_kernel(2);
        let init = boot(&k);
        let helper = k.spawn_thread(init).unwrap();
        k.yield_smp(MASTER_CORE).unwrap();
        assert_eq!(k.harts.running(1), Some(helper));
        // init 用掉一点时间片
        assert!(!k.tick());

        let other = k.create_process("other", Credentials::ROOT).unwrap();
        let dispatch = k.yield_smp(MASTER_CORE).unwrap();
        assert_eq!(dispatch.process, other);
        assert!(dispatch.slaves.is_empty());
        assert_eq!(k.harts.running(1), None);
        assert_eq!(k.thread_info(helper).unwrap().state, ThreadState::Ready);
        assert_eq!(k.process_state(init), Ok(ProcessState::Ready));

        // 落选的 init 老化后重新胜出
        let dispatch = k.yield_smp(MASTER_CORE).unwrap();
        assert_eq!(dispatch.process, init);
        assert_eq!(dispatch.slaves.as_slice(), &[(1, helper)]);
    }

    #[test]
    fn sync_call_is_served_on_next_schedule() {
        let k = smp_kernel(2);
        let init = boot(&k);
        let helper = k.spawn_thread(init).unwrap();
        k.yield_smp(MASTER_CORE).unwrap();

        k.sync_call(helper).unwrap();
        let info = k.thread_info(helper).unwrap();
        assert_eq!(info.sync_call, SyncCall::Pending);
        assert_eq!(info.state, ThreadState::Sleeping);
        assert_eq!(k.harts.running(1), None);
        // 主核上的线程不需要同步调用
        assert!(k.sync_call(k.current_thread_of(init)).is_err());

        let dispatch = k.yield_smp(MASTER_CORE).unwrap();
        assert_eq!(dispatch.slaves.as_slice(), &[(1, helper)]);
        let info = k.thread_info(helper).unwrap();
        assert_eq!(info.sync_call, SyncCall::None);
        assert_eq!(info.state, ThreadState::Running);
    }

    #[test]
    fn nothing_runnable_leaves_master_idle() {
        let k = smp_kernel(2);
        let dispatch = k.yield_smp(MASTER_CORE).unwrap();
        assert_eq!(dispatch.process, Pid::IDLE);
        assert_eq!(dispatch.master, Tid::IDLE);
        assert_eq!(k.current(), Tid::IDLE);
    }
}
