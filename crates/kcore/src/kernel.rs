use std::sync::Arc;

use defines::config::MASTER_CORE;
use klocks::SpinMutex;

use crate::{
    config::KernelConfig,
    fs::{BlockDevice, BufferCache},
    hart::Harts,
    memory::{frame::FrameTable, pte::FRAME_BITS, region::RegionTable, swap::SwapTable, MmGuard},
    process::{Pid, ProcTable},
    thread::Tid,
};

/// 整个子系统的状态。每张全局表各有一把锁
pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) procs: SpinMutex<ProcTable>,
    pub(crate) regions: SpinMutex<RegionTable>,
    pub(crate) frames: SpinMutex<FrameTable>,
    pub(crate) swap: SpinMutex<SwapTable>,
    pub(crate) swap_dev: Arc<dyn BlockDevice>,
    pub(crate) bcache: Arc<dyn BufferCache>,
    pub(crate) harts: Harts,
}

impl Kernel {
    /// 建立各张表与 idle 线程，多核配置下同时启动从核
    ///
    /// # Panics
    ///
    /// 页帧数或交换槽数超出 PTE 帧号字段的表示范围
    pub fn new(
        config: KernelConfig,
        swap_dev: Arc<dyn BlockDevice>,
        bcache: Arc<dyn BufferCache>,
    ) -> Self {
        crate::tracer::init();
        assert!(config.frames <= 1 << FRAME_BITS, "too many frames");
        assert!(config.swap_slots < 1 << FRAME_BITS, "too many swap slots");
        info!(
            "kernel boots with {} frames, {} swap slots, {} cores",
            config.frames, config.swap_slots, config.cores
        );
        Self {
            procs: SpinMutex::new(ProcTable::new()),
            regions: SpinMutex::new(RegionTable::new()),
            frames: SpinMutex::new(FrameTable::new(config.frames)),
            swap: SpinMutex::new(SwapTable::new(config.swap_slots)),
            harts: Harts::start(config.cores),
            swap_dev,
            bcache,
            config,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// 主核上正在运行的线程
    pub fn current(&self) -> Tid {
        self.procs.lock().current(MASTER_CORE)
    }

    pub fn current_pid(&self) -> Pid {
        let procs = self.procs.lock();
        procs.thread(procs.current(MASTER_CORE)).pid()
    }

    /// 按 region → 页帧 → 交换区的顺序拿齐内存相关的锁
    pub(crate) fn lock_mm(&self) -> MmGuard<'_> {
        MmGuard {
            regions: self.regions.lock(),
            frames: self.frames.lock(),
            swap: self.swap.lock(),
        }
    }
}
