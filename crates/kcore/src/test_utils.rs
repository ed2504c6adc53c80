use std::sync::Arc;

use defines::config::{MASTER_CORE, PAGE_SIZE};

use crate::{
    drivers::RamDisk,
    fs::{BlockDevice, BufferCache},
    memory::region::{RegionAccess, RegionFlags, RegionId},
    process::{Credentials, Pid},
    sleep::ChainId,
    thread::Tid,
    Kernel, KernelConfig,
};

pub fn kernel() -> Kernel {
    kernel_with(KernelConfig::default())
}

pub fn kernel_with(config: KernelConfig) -> Kernel {
    kernel_with_disk(config).0
}

/// 交换区与文件数据共用一块内存盘
pub fn kernel_with_disk(config: KernelConfig) -> (Kernel, Arc<RamDisk>) {
    let capacity = config.swap_offset + config.swap_slots * PAGE_SIZE;
    let disk = Arc::new(RamDisk::new(0, capacity));
    let swap_dev: Arc<dyn BlockDevice> = disk.clone();
    let bcache: Arc<dyn BufferCache> = disk.clone();
    let k = Kernel::new(config, swap_dev, bcache);
    (k, disk)
}

/// 创建 init 并让它在主核上运行
pub fn boot(k: &Kernel) -> Pid {
    let pid = k
        .create_process("init", Credentials::ROOT)
        .expect("empty process table");
    k.run(pid);
    pid
}

/// 分配一个 `pages` 页、只有 root 可访问的私有 region 并挂到 `pid` 上
pub fn private_region(
    k: &Kernel,
    pid: Pid,
    slot: usize,
    addr: usize,
    pages: usize,
    flags: RegionFlags,
) -> RegionId {
    let access = RegionAccess::new(0o600, &Credentials::ROOT);
    let rid = k.allocreg(access, pages * PAGE_SIZE, flags, None).unwrap();
    k.attachreg(pid, slot, addr, rid).unwrap();
    k.unlockreg(rid);
    rid
}

impl Kernel {
    /// 直接让 `pid` 的主线程占据主核
    pub fn run(&self, pid: Pid) {
        let mut procs = self.procs.lock();
        let tid = procs.proc(pid).unwrap().threads()[0];
        if procs.current(MASTER_CORE) == tid {
            return;
        }
        procs.requeue(MASTER_CORE);
        procs.switch_to(MASTER_CORE, tid);
    }

    pub fn current_thread_of(&self, pid: Pid) -> Tid {
        self.procs.lock().proc(pid).unwrap().threads()[0]
    }

    pub fn is_sleeping_on(&self, tid: Tid, chain: ChainId) -> bool {
        self.procs.lock().is_sleeping_on(tid, chain)
    }
}
