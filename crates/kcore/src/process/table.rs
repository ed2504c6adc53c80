//! 进程表与线程表
//!
//! 进程按 pid 下标存放在定长的表中，线程放在 slab 中。两者连同睡眠链与各核正在运行的线程由同一把锁保护

use compact_str::CompactString;
use defines::{
    config::{HART_NUM, MASTER_CORE, MAX_THREADS_PER_PROC, NR_PROCS, NR_THREADS},
    error::{errno, KResult},
};
use idallocator::RecycleAllocator;
use slab::Slab;

use super::{Credentials, Pid, Process, ProcessState};
use crate::{
    sleep::SleepChains,
    thread::{Thread, ThreadState, Tid},
};

pub struct ProcTable {
    procs: Vec<Option<Process>>,
    pids: RecycleAllocator,
    threads: Slab<Thread>,
    pub(crate) chains: SleepChains,
    running: [Option<Tid>; HART_NUM],
    /// 时钟周期数
    pub(crate) clock: u64,
}

impl ProcTable {
    /// 建立 idle 进程与 idle 线程，后者运行在主核上
    pub fn new() -> Self {
        let mut procs: Vec<Option<Process>> = (0..NR_PROCS).map(|_| None).collect();
        let mut idle = Process::new(
            Pid::IDLE,
            CompactString::const_new("idle"),
            None,
            Credentials::ROOT,
        );
        idle.system = true;
        idle.state = ProcessState::Running;
        let mut threads = Slab::with_capacity(NR_THREADS);
        let tid = Tid(threads.insert(Thread::new(Tid::IDLE, Pid::IDLE, true)));
        debug_assert_eq!(tid, Tid::IDLE);
        threads[tid.0].state = ThreadState::Running;
        threads[tid.0].hart = Some(MASTER_CORE);
        let _ = idle.threads.push(tid);
        procs[0] = Some(idle);
        let mut running = [None; HART_NUM];
        running[MASTER_CORE] = Some(tid);
        Self {
            procs,
            pids: RecycleAllocator::bounded(1, NR_PROCS),
            threads,
            chains: SleepChains::default(),
            running,
            clock: 0,
        }
    }

    pub fn proc(&self, pid: Pid) -> KResult<&Process> {
        self.procs
            .get(pid.0)
            .and_then(Option::as_ref)
            .ok_or(errno::ESRCH)
    }

    pub fn proc_mut(&mut self, pid: Pid) -> KResult<&mut Process> {
        self.procs
            .get_mut(pid.0)
            .and_then(Option::as_mut)
            .ok_or(errno::ESRCH)
    }

    /// 按表序遍历所有进程，包括 idle
    pub fn procs(&self) -> impl Iterator<Item = &Process> + '_ {
        self.procs.iter().flatten()
    }

    pub(crate) fn procs_mut(&mut self) -> impl Iterator<Item = &mut Process> + '_ {
        self.procs.iter_mut().flatten()
    }

    /// # Panics
    ///
    /// 线程必须存在
    pub fn thread(&self, tid: Tid) -> &Thread {
        self.try_thread(tid)
            .unwrap_or_else(|| panic!("thread {tid} does not exist"))
    }

    pub(crate) fn thread_mut(&mut self, tid: Tid) -> &mut Thread {
        self.try_thread_mut(tid)
            .unwrap_or_else(|| panic!("thread {tid} does not exist"))
    }

    pub fn try_thread(&self, tid: Tid) -> Option<&Thread> {
        self.threads.get(tid.0)
    }

    pub(crate) fn try_thread_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        self.threads.get_mut(tid.0)
    }

    /// 按表序遍历所有线程
    pub fn threads(&self) -> impl Iterator<Item = &Thread> + '_ {
        self.threads.iter().map(|(_, thread)| thread)
    }

    pub(crate) fn threads_mut(&mut self) -> impl Iterator<Item = &mut Thread> + '_ {
        self.threads.iter_mut().map(|(_, thread)| thread)
    }

    /// 某个核上正在运行的线程，空闲的从核返回 idle
    pub fn current(&self, hart: usize) -> Tid {
        self.running[hart].unwrap_or(Tid::IDLE)
    }

    pub fn running(&self, hart: usize) -> Option<Tid> {
        self.running[hart]
    }

    pub fn current_pid(&self) -> Pid {
        self.thread(self.current(MASTER_CORE)).pid()
    }

    pub(crate) fn add_process(
        &mut self,
        name: &str,
        parent: Option<Pid>,
        creds: Credentials,
    ) -> KResult<Pid> {
        if self.threads.len() >= NR_THREADS {
            return Err(errno::EAGAIN);
        }
        let Some(pid) = self.pids.alloc().map(Pid) else {
            warn!("process table is full");
            return Err(errno::EAGAIN);
        };
        let mut proc = Process::new(pid, CompactString::new(name), parent, creds);
        let tid = Tid(self.threads.vacant_key());
        self.threads.insert(Thread::new(tid, pid, false));
        let _ = proc.threads.push(tid);
        if let Some(parent) = parent {
            if let Ok(parent) = self.proc_mut(parent) {
                parent.children.push(pid);
            }
        }
        self.procs[pid.0] = Some(proc);
        Ok(pid)
    }

    pub(crate) fn add_thread(&mut self, pid: Pid) -> KResult<Tid> {
        if self.threads.len() >= NR_THREADS {
            return Err(errno::EAGAIN);
        }
        let tid = Tid(self.threads.vacant_key());
        let proc = self.proc_mut(pid)?;
        if proc.threads.is_full() || proc.threads.len() >= MAX_THREADS_PER_PROC {
            return Err(errno::EAGAIN);
        }
        let _ = proc.threads.push(tid);
        self.threads.insert(Thread::new(tid, pid, false));
        Ok(tid)
    }

    /// 把当前线程放回就绪状态，供调度器重新挑选
    pub(crate) fn requeue(&mut self, hart: usize) {
        let Some(tid) = self.running[hart].take() else {
            return;
        };
        let thread = self.thread_mut(tid);
        thread.hart = None;
        if thread.state == ThreadState::Running {
            thread.state = ThreadState::Ready;
        }
        let pid = thread.pid();
        if let Ok(proc) = self.proc_mut(pid) {
            if proc.state == ProcessState::Running {
                proc.state = ProcessState::Ready;
            }
        }
    }

    /// # Panics
    ///
    /// 调度一个不处于就绪状态的线程是致命错误
    pub(crate) fn switch_to(&mut self, hart: usize, tid: Tid) {
        assert!(self.running[hart].is_none(), "hart {hart} is still busy");
        let thread = self.thread_mut(tid);
        if thread.state != ThreadState::Ready {
            error!("schedule thread {tid} in state {:?}", thread.state);
            panic!("schedule thread {tid} which is not ready");
        }
        thread.state = ThreadState::Running;
        thread.hart = Some(hart);
        let pid = thread.pid();
        if let Ok(proc) = self.proc_mut(pid) {
            proc.state = ProcessState::Running;
        }
        self.running[hart] = Some(tid);
    }

    /// 从核被收回时调用
    pub(crate) fn clear_running(&mut self, hart: usize) {
        self.running[hart] = None;
    }

    /// 释放进程槽、pid 以及它的所有线程
    pub(crate) fn bury(&mut self, pid: Pid) -> Option<Process> {
        let proc = self.procs.get_mut(pid.0)?.take()?;
        for tid in &proc.threads {
            self.threads.remove(tid.0);
        }
        if let Some(parent) = proc.parent {
            if let Ok(parent) = self.proc_mut(parent) {
                parent.children.retain(|child| *child != pid);
            }
        }
        self.pids.dealloc(pid.0);
        info!("process {pid} reaped");
        Some(proc)
    }
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new()
    }
}
