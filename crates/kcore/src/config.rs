use defines::config::{HART_NUM, HDD_SIZE, MAX_PROC_PAGES, NR_FRAMES, NR_SWAP};

/// 运行时可调的内核参数，默认值取自 [`defines::config`]
#[derive(Clone, Debug)]
pub struct KernelConfig {
    /// 物理页帧数
    pub frames: usize,
    /// 核心数，1 表示单核调度
    pub cores: usize,
    /// 交换区槽数
    pub swap_slots: usize,
    /// 交换区在块设备上的起始偏移
    pub swap_offset: usize,
    /// 单个进程最多占用的页数
    pub max_proc_pages: usize,
    /// 栈在缺页时自动增长的上限（页）
    pub max_stack_pages: usize,
}

/// 默认允许栈自动增长到 1MiB
pub const DEFAULT_MAX_STACK_PAGES: usize = 256;

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            frames: NR_FRAMES,
            cores: 1,
            swap_slots: NR_SWAP,
            swap_offset: HDD_SIZE,
            max_proc_pages: MAX_PROC_PAGES,
            max_stack_pages: DEFAULT_MAX_STACK_PAGES,
        }
    }
}

impl KernelConfig {
    #[must_use]
    pub fn with_frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }

    /// # Panics
    ///
    /// 核心数必须在 `1..=HART_NUM` 之间
    #[must_use]
    pub fn with_cores(mut self, cores: usize) -> Self {
        assert!((1..=HART_NUM).contains(&cores), "unsupported core count {cores}");
        self.cores = cores;
        self
    }

    #[must_use]
    pub fn with_swap_slots(mut self, slots: usize) -> Self {
        self.swap_slots = slots;
        self
    }

    #[must_use]
    pub fn with_swap_offset(mut self, offset: usize) -> Self {
        self.swap_offset = offset;
        self
    }

    #[must_use]
    pub fn with_max_proc_pages(mut self, pages: usize) -> Self {
        self.max_proc_pages = pages;
        self
    }

    #[must_use]
    pub fn with_max_stack_pages(mut self, pages: usize) -> Self {
        self.max_stack_pages = pages;
        self
    }
}
