#[allow(non_upper_case_globals)]
pub const KiB: usize = 1024;
#[allow(non_upper_case_globals)]
pub const MiB: usize = 1024 * KiB;

/// 一个页大小的 bit 数
pub const PAGE_SIZE_BITS: usize = 12;
/// 页大小
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_BITS;
pub const PAGE_OFFSET_MASK: usize = PAGE_SIZE - 1;

/// 每张页表中 PTE 的数量（两级页表，每张页表覆盖 4MiB）
pub const PTES_PER_TABLE: usize = 1024;
/// 一张页表覆盖的虚拟地址范围
pub const TABLE_SPAN: usize = PTES_PER_TABLE * PAGE_SIZE;
/// 页目录项的数量，覆盖整个 32 位地址空间
pub const PDES_PER_DIR: usize = 1024;

/// 每个 region 最多拥有的页表数，也就决定了 region 的最大跨度
pub const REGION_TABLES: usize = 4;
/// 单个 region 可寻址的最大字节数
pub const REGION_MAX_SIZE: usize = REGION_TABLES * TABLE_SPAN;

/// 全局 region 表的大小
pub const NR_REGIONS: usize = 64;
/// 每个进程的 pregion 槽数
pub const NR_PREGIONS: usize = 8;
/// 固定用途的 pregion 槽，其余为通用槽
pub const PREGION_TEXT: usize = 0;
pub const PREGION_DATA: usize = 1;
pub const PREGION_STACK: usize = 2;
pub const PREGION_HEAP: usize = 3;

/// 进程表与线程表的大小
pub const NR_PROCS: usize = 64;
pub const NR_THREADS: usize = 128;
/// 单个进程最多拥有的线程数
pub const MAX_THREADS_PER_PROC: usize = 8;

/// 默认的物理页帧数量，即 4MiB 用户内存
pub const NR_FRAMES: usize = 1024;

/// 交换区的槽数
pub const NR_SWAP: usize = 512;
/// 交换区位于块设备上这个偏移之后，之前是文件系统
pub const HDD_SIZE: usize = 32 * MiB;
/// 块设备的块大小
pub const BLOCK_SIZE: usize = 1024;

/// 用户地址空间的范围
pub const USER_BASE: usize = 0x4000_0000;
pub const USER_END: usize = 0xC000_0000;

/// 单个进程最多占用的页数
pub const MAX_PROC_PAGES: usize = 8192;

/// 线程被选中运行时计数器重置为这个值
pub const QUANTUM: i32 = 20;

/// 核心数的上限
pub const HART_NUM: usize = 8;
/// 唯一有权调度的核心
pub const MASTER_CORE: usize = 0;

/// 进程睡眠优先级。非负为可中断睡眠，负数为不可中断睡眠
pub const PRI_REGION: i32 = 25;
pub const PRI_WAIT: i32 = 20;
pub const PRI_PAUSE: i32 = 30;

const _: () = assert!(TABLE_SPAN as u64 * PDES_PER_DIR as u64 == 1 << 32);
const _: () = assert!(USER_BASE % TABLE_SPAN == 0 && USER_END % TABLE_SPAN == 0);
const _: () = assert!(HDD_SIZE % PAGE_SIZE == 0 && PAGE_SIZE % BLOCK_SIZE == 0);
