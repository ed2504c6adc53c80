use defines::config::{MASTER_CORE, QUANTUM};

use crate::{
    process::ProcTable,
    thread::{ThreadState, Tid},
    Kernel,
};

impl Kernel {
    /// 单核调度，返回被选中的线程
    pub fn yield_up(&self) -> Tid {
        self.procs.lock().schedule_up()
    }
}

impl ProcTable {
    pub(crate) fn schedule_up(&mut self) -> Tid {
        self.requeue(MASTER_CORE);
        self.sweep_alarms();
        let next = self.pick_thread();
        self.switch_to(MASTER_CORE, next);
        trace!("schedule thread {next}");
        next
    }

    /// 扫描整张线程表，选出老化计数器（减去 nice）最大的就绪线程。比较是严格大于，所以相同时表中靠前的胜出。
    ///
    /// 落选的就绪线程计数器加一，胜者重置为一个时间片。没有就绪线程时返回 idle
    pub(crate) fn pick_thread(&mut self) -> Tid {
        let mut best: Option<(Tid, i32)> = None;
        for thread in self.threads() {
            if thread.tid() == Tid::IDLE || thread.state() != ThreadState::Ready {
                continue;
            }
            let value = self
                .proc(thread.pid())
                .map_or(thread.counter(), |proc| proc.effective(thread.counter()));
            if best.map_or(true, |(_, best)| value > best) {
                best = Some((thread.tid(), value));
            }
        }
        let Some((winner, _)) = best else {
            return Tid::IDLE;
        };
        for thread in self.threads_mut() {
            if thread.tid() == winner {
                thread.counter = QUANTUM;
            } else if thread.state == ThreadState::Ready && !thread.is_system() {
                thread.counter = thread.counter.saturating_add(1);
            }
        }
        winner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        process::Credentials,
        test_utils::{boot, kernel},
    };

    #[test]
    fn equal_counters_pick_table_order() {
        let k = kernel();
        let first = boot(&k);
        let second = k.create_process("second", Credentials::ROOT).unwrap();
        let third = k.create_process("third", Credentials::ROOT).unwrap();
        let [t1, t2, t3] = [first, second, third].map(|pid| k.current_thread_of(pid));
        {
            let mut procs = k.procs.lock();
            for tid in [t1, t2, t3] {
                procs.thread_mut(tid).counter = 5;
            }
        }
        assert_eq!(k.yield_up(), t1);
        // 落选者都老化了一次
        assert_eq!(k.thread_info(t2).unwrap().counter, 6);
        assert_eq!(k.thread_info(t3).unwrap().counter, 6);
        assert_eq!(k.thread_info(t1).unwrap().counter, QUANTUM);

        // 重新构造平局，结果不变
        {
            let mut procs = k.procs.lock();
            for tid in [t1, t2, t3] {
                procs.thread_mut(tid).counter = 9;
            }
        }
        assert_eq!(k.yield_up(), t1);
    }

    #[test]
    fn highest_counter_wins() {
        let k = kernel();
        boot(&k);
        let other = k.create_process("other", Credentials::ROOT).unwrap();
        let tid = k.current_thread_of(other);
        k.procs.lock().thread_mut(tid).counter = QUANTUM + 1;
        assert_eq!(k.yield_up(), tid);
    }

    #[test]
    fn nice_biases_selection() {
        let k = kernel();
        let a = boot(&k);
        let b = k.create_process("b", Credentials::ROOT).unwrap();
        k.set_nice(a, 5).unwrap();
        {
            let mut procs = k.procs.lock();
            let ta = procs.proc(a).unwrap().threads()[0];
            procs.thread_mut(ta).counter = QUANTUM + 3;
        }
        assert_eq!(k.yield_up(), k.current_thread_of(b));
    }

    #[test]
    fn every_ready_thread_eventually_runs() {
        let k = kernel();
        boot(&k);
        let pids: Vec<_> = (0..4)
            .map(|i| k.create_process(&format!("p{i}"), Credentials::ROOT).unwrap())
            .collect();
        // 让第一个进程的计数器远远领先
        let lead = k.current_thread_of(pids[0]);
        k.procs.lock().thread_mut(lead).counter = 100;
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let tid = k.yield_up();
            seen.insert(tid);
            // 模拟时间片被用掉
            k.procs.lock().thread_mut(tid).counter = 0;
        }
        for pid in pids {
            assert!(seen.contains(&k.current_thread_of(pid)), "process {pid} starved");
        }
    }

    #[test]
    fn falls_back_to_idle() {
        let k = kernel();
        assert_eq!(k.yield_up(), Tid::IDLE);
        assert_eq!(k.thread_info(Tid::IDLE).unwrap().state, ThreadState::Running);
    }
}
