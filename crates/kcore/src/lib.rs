//! 一个 UNIX 风格内核的进程、内存与调度子系统
//!
//! 物理内存由页帧表模拟，交换设备与文件系统以 trait 对象的形式接入，SMP 下的从核是独立的宿主线程。
//! 所有全局表各自由一把 [`klocks::SpinMutex`] 保护，加锁顺序固定为
//! 进程表 → region 表 → 页帧表 → 交换表。

#[macro_use]
extern crate kernel_tracer;

mod config;
pub mod drivers;
pub mod fs;
mod hart;
mod kernel;
pub mod memory;
pub mod process;
pub mod sched;
pub mod signal;
pub mod sleep;
pub mod thread;
pub mod tracer;
pub mod trap;

#[cfg(test)]
mod test_utils;

pub use config::KernelConfig;
pub use kernel::Kernel;
