//! 进程：身份、线程、信号、地址空间与调度参数
//!
//! 进程的生命周期是 `fork`/`create_process` 创建，`exit` 后成为僵尸，被父进程 `wait` 回收。
//! 父进程先死时子进程交给 init 收养

mod table;

use compact_str::CompactString;
use defines::{
    config::{MASTER_CORE, MAX_THREADS_PER_PROC, PRI_WAIT, QUANTUM},
    error::{errno, KResult},
    signal::{KSignalSet, Signal},
};
use derive_more::Display;
use smallvec::SmallVec;

pub use self::table::ProcTable;
use crate::{
    memory::{region::RegionId, AddressSpace, MmGuard},
    signal::SignalHandlers,
    sleep::ChainId,
    thread::{ThreadState, Tid},
    Kernel,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub struct Pid(pub usize);

impl Pid {
    pub const IDLE: Pid = Pid(0);
    pub const INIT: Pid = Pid(1);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Stopped,
    Zombie,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
}

impl Credentials {
    pub const ROOT: Credentials = Credentials::user(0, 0);

    pub const fn user(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            euid: uid,
            egid: gid,
        }
    }

    pub fn is_root(&self) -> bool {
        self.euid == 0
    }
}

/// `wait` 返回的状态，编码与 POSIX 的 `wstatus` 相同
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[display("{_0:#x}")]
pub struct WaitStatus(pub i32);

impl WaitStatus {
    pub fn exited(code: u8) -> Self {
        Self(i32::from(code) << 8)
    }

    pub fn signaled(signal: Signal, core_dumped: bool) -> Self {
        let core = if core_dumped { 0x80 } else { 0 };
        Self(i32::from(signal.to_user()) | core)
    }

    pub fn exit_code(self) -> Option<u8> {
        (self.0 & 0x7f == 0).then_some((self.0 >> 8) as u8)
    }

    pub fn term_signal(self) -> Option<Signal> {
        Signal::from_user((self.0 & 0x7f) as u8)
    }

    pub fn core_dumped(self) -> bool {
        self.0 & 0x80 != 0
    }
}

pub struct Process {
    pid: Pid,
    name: CompactString,
    pub(crate) parent: Option<Pid>,
    pub(crate) children: SmallVec<[Pid; 4]>,
    pub creds: Credentials,
    pub(crate) state: ProcessState,
    pub(crate) threads: heapless::Vec<Tid, MAX_THREADS_PER_PROC>,
    pub(crate) handlers: SignalHandlers,
    /// 已收到但尚未处理的信号
    pub(crate) pending: KSignalSet,
    pub(crate) space: AddressSpace,
    pub(crate) nice: i32,
    /// 多核调度时以进程为单位老化
    pub(crate) counter: i32,
    /// 闹钟到期的时钟周期
    pub(crate) alarm: Option<u64>,
    pub(crate) exit_status: Option<WaitStatus>,
    pub(crate) system: bool,
}

impl Process {
    fn new(pid: Pid, name: CompactString, parent: Option<Pid>, creds: Credentials) -> Self {
        Self {
            pid,
            name,
            parent,
            children: SmallVec::new(),
            creds,
            state: ProcessState::Ready,
            threads: heapless::Vec::new(),
            handlers: SignalHandlers::new(),
            pending: KSignalSet::empty(),
            space: AddressSpace::new(),
            nice: 0,
            counter: QUANTUM,
            alarm: None,
            exit_status: None,
            system: false,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    pub fn children(&self) -> &[Pid] {
        &self.children
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn threads(&self) -> &[Tid] {
        &self.threads
    }

    pub fn pending(&self) -> KSignalSet {
        self.pending
    }

    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn exit_status(&self) -> Option<WaitStatus> {
        self.exit_status
    }

    pub fn is_system(&self) -> bool {
        self.system
    }

    /// 调度时比较的值，nice 越大越吃亏
    pub(crate) fn effective(&self, counter: i32) -> i32 {
        counter - self.nice
    }
}

impl Kernel {
    /// 直接创建一个只有主线程、没有任何 region 的进程。第一个创建的进程就是 init，其余的由 init 领养
    pub fn create_process(&self, name: &str, creds: Credentials) -> KResult<Pid> {
        let mut procs = self.procs.lock();
        let parent = procs.proc(Pid::INIT).is_ok().then_some(Pid::INIT);
        let pid = procs.add_process(name, parent, creds)?;
        info!("process {pid} ({name}) created");
        Ok(pid)
    }

    /// 复制进程。私有 region 以写时复制的方式共享页帧，共享的 region 直接再挂一次。
    ///
    /// 返回子进程的 pid；子进程主线程的返回值寄存器为 0
    pub fn fork(&self, pid: Pid) -> KResult<Pid> {
        let _enter = info_span!("fork", pid = pid.0).entered();
        let mut procs = self.procs.lock();
        let mut mm = self.lock_mm();

        let parent = procs.proc(pid)?;
        let name = parent.name.clone();
        let (creds, nice, handlers) = (parent.creds, parent.nice, parent.handlers.clone());
        let pregions: SmallVec<[_; 8]> = parent.space.pregions().collect();
        let current = procs.current(MASTER_CORE);
        let main = if parent.threads.contains(&current) {
            current
        } else {
            parent.threads[0]
        };
        let mut context = procs.thread(main).context.clone();

        let child = procs.add_process(&name, Some(pid), creds)?;
        {
            let child_proc = procs.proc_mut(child)?;
            child_proc.nice = nice;
            child_proc.handlers = handlers;
            let tid = child_proc.threads[0];
            context.eax = 0;
            procs.thread_mut(tid).context = context;
        }

        for (slot, pregion) in pregions {
            let src = pregion.region;
            let res = self.with_region_locked(&mut procs, &mut mm, src, |procs, mm| {
                let tid = procs.current(MASTER_CORE);
                let dst = mm.regions.dup(src, tid, &mut mm.frames, &mut mm.swap)?;
                let attached =
                    self.attach_locked(procs.proc_mut(child)?, &mut mm.regions, slot, pregion.addr, dst);
                if dst != src {
                    if attached.is_ok() {
                        mm.regions.unlock(dst, tid);
                    } else {
                        mm.regions.free(dst, &mut mm.frames, &mut mm.swap);
                    }
                }
                attached
            });
            if let Err(e) = res {
                warn!("fork of {pid} failed at pregion {slot}: {e}");
                Self::discard(&mut procs, &mut mm, child);
                return Err(e);
            }
        }
        info!("process {pid} forked {child}");
        Ok(child)
    }

    /// 撤销一个尚未运行过的子进程
    fn discard(procs: &mut ProcTable, mm: &mut MmGuard<'_>, pid: Pid) {
        let mut freed: SmallVec<[RegionId; 4]> = SmallVec::new();
        if let Ok(proc) = procs.proc_mut(pid) {
            let slots: SmallVec<[usize; 8]> = proc.space.pregions().map(|(slot, _)| slot).collect();
            for slot in slots {
                if let Ok(Some(rid)) = Self::detach_locked(&mut proc.space, mm, slot) {
                    freed.push(rid);
                }
            }
        }
        for rid in freed {
            procs.wakeup(ChainId::Region(rid));
        }
        procs.bury(pid);
    }

    pub fn exit(&self, pid: Pid, code: u8) -> KResult<()> {
        self.exit_with(pid, WaitStatus::exited(code))
    }

    /// 进程终止：卸下全部 region，线程全部死亡，子进程交给 init，通知父进程
    ///
    /// # Panics
    ///
    /// init 与 idle 不能退出
    pub fn exit_with(&self, pid: Pid, status: WaitStatus) -> KResult<()> {
        let mut procs = self.procs.lock();
        let mut mm = self.lock_mm();
        self.exit_locked(&mut procs, &mut mm, pid, status)
    }

    pub(crate) fn exit_locked(
        &self,
        procs: &mut ProcTable,
        mm: &mut MmGuard<'_>,
        pid: Pid,
        status: WaitStatus,
    ) -> KResult<()> {
        if pid == Pid::INIT || pid == Pid::IDLE {
            error!("process {pid} tries to exit with {status}");
            panic!("attempt to kill process {pid}");
        }
        let proc = procs.proc_mut(pid)?;
        if proc.state == ProcessState::Zombie {
            return Ok(());
        }
        let slots: SmallVec<[usize; 8]> = proc.space.pregions().map(|(slot, _)| slot).collect();
        let mut freed: SmallVec<[RegionId; 4]> = SmallVec::new();
        for slot in slots {
            if let Some(rid) = Self::detach_locked(&mut proc.space, mm, slot)? {
                freed.push(rid);
            }
        }
        proc.state = ProcessState::Zombie;
        proc.exit_status = Some(status);
        proc.alarm = None;
        proc.pending = KSignalSet::empty();
        let threads = proc.threads.clone();
        let children = core::mem::take(&mut proc.children);
        let parent = proc.parent;
        for rid in freed {
            procs.wakeup(ChainId::Region(rid));
        }

        let mut was_current = false;
        for tid in threads {
            let thread = procs.thread_mut(tid);
            let chain = thread.chain.take();
            let hart = thread.hart.take();
            thread.state = ThreadState::Dead;
            if let Some(chain) = chain {
                procs.chains.remove(chain, tid);
            }
            match hart {
                Some(MASTER_CORE) => {
                    procs.clear_running(MASTER_CORE);
                    was_current = true;
                }
                Some(hart) => {
                    procs.clear_running(hart);
                    self.harts.idle(hart);
                }
                None => {}
            }
        }

        let mut zombie_orphans = false;
        for child in &children {
            if let Ok(child) = procs.proc_mut(*child) {
                child.parent = Some(Pid::INIT);
                zombie_orphans |= child.state == ProcessState::Zombie;
            }
        }
        if let Ok(init) = procs.proc_mut(Pid::INIT) {
            init.children.extend(children);
        }
        if zombie_orphans {
            procs.post_signal(Pid::INIT, Signal::SIGCHLD)?;
            procs.wakeup(ChainId::Wait(Pid::INIT));
        }
        info!("process {pid} exits with status {status}");
        if let Some(parent) = parent {
            procs.post_signal(parent, Signal::SIGCHLD)?;
            procs.wakeup(ChainId::Wait(parent));
        }
        if was_current {
            self.reschedule(procs);
        }
        Ok(())
    }

    /// 回收当前进程的一个僵尸子进程。没有僵尸时睡在自己的等待链上并返回 `ERESTART`
    pub fn wait(&self) -> KResult<(Pid, WaitStatus)> {
        let mut procs = self.procs.lock();
        let pid = procs.current_pid();
        let proc = procs.proc(pid)?;
        if proc.children.is_empty() {
            return Err(errno::ECHILD);
        }
        let zombie = proc.children.iter().copied().find(|child| {
            procs
                .proc(*child)
                .is_ok_and(|child| child.state == ProcessState::Zombie)
        });
        if let Some(child) = zombie {
            let status = procs
                .bury(child)
                .and_then(|child| child.exit_status)
                .expect("zombie without exit status");
            return Ok((child, status));
        }
        self.sleep_locked(&mut procs, ChainId::Wait(pid), PRI_WAIT)?;
        Err(errno::ERESTART)
    }

    /// 在 `ticks` 个时钟周期后向进程发送 `SIGALRM`，为 0 时取消。返回之前的闹钟剩余的周期数
    pub fn alarm(&self, pid: Pid, ticks: u64) -> KResult<u64> {
        let mut procs = self.procs.lock();
        let clock = procs.clock;
        let proc = procs.proc_mut(pid)?;
        let remaining = proc.alarm.map_or(0, |at| at.saturating_sub(clock));
        proc.alarm = (ticks > 0).then_some(clock + ticks);
        Ok(remaining)
    }

    pub fn set_nice(&self, pid: Pid, nice: i32) -> KResult<()> {
        self.procs.lock().proc_mut(pid)?.nice = nice;
        Ok(())
    }

    /// 在进程内新建一个就绪的线程
    pub fn spawn_thread(&self, pid: Pid) -> KResult<Tid> {
        let mut procs = self.procs.lock();
        if procs.proc(pid)?.state == ProcessState::Zombie {
            return Err(errno::ESRCH);
        }
        let tid = procs.add_thread(pid)?;
        debug!("process {pid} spawns thread {tid}");
        Ok(tid)
    }

    pub fn process_state(&self, pid: Pid) -> KResult<ProcessState> {
        Ok(self.procs.lock().proc(pid)?.state)
    }

    pub fn children(&self, pid: Pid) -> KResult<SmallVec<[Pid; 4]>> {
        Ok(self.procs.lock().proc(pid)?.children.clone())
    }

    pub fn threads(&self, pid: Pid) -> KResult<heapless::Vec<Tid, MAX_THREADS_PER_PROC>> {
        Ok(self.procs.lock().proc(pid)?.threads.clone())
    }
}
