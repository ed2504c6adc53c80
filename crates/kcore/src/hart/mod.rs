//! 从核
//!
//! 每个从核是一个宿主线程，只认两种核间中断：停下，或者开始运行某个线程。
//! 主核发出中断后等待从核应答，因此 [`Harts::idle`] 返回时从核一定已经停下

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use async_channel::{Receiver, Sender};
use crossbeam_utils::CachePadded;

use crate::thread::Tid;

/// 从核空闲
const NOTHING: usize = usize::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Ipi {
    Idle,
    Schedule(Tid),
}

struct Slave {
    ipi: Sender<Ipi>,
    ack: Receiver<usize>,
    handle: Option<JoinHandle<()>>,
}

pub(crate) struct Harts {
    slaves: Vec<Slave>,
    /// 各核自己记录的当前线程。主核的一项不使用，以进程表为准
    running: Arc<[CachePadded<AtomicUsize>]>,
}

impl Harts {
    /// # Panics
    ///
    /// 宿主系统无法创建线程
    pub fn start(cores: usize) -> Self {
        let running: Arc<[CachePadded<AtomicUsize>]> = (0..cores)
            .map(|_| CachePadded::new(AtomicUsize::new(NOTHING)))
            .collect();
        let slaves = (1..cores)
            .map(|hart| {
                let (ipi_tx, ipi_rx) = async_channel::bounded(1);
                let (ack_tx, ack_rx) = async_channel::bounded(1);
                let running = Arc::clone(&running);
                let handle = std::thread::Builder::new()
                    .name(format!("hart{hart}"))
                    .spawn(move || slave_main(hart, &ipi_rx, &ack_tx, &running))
                    .expect("failed to start hart");
                Slave {
                    ipi: ipi_tx,
                    ack: ack_rx,
                    handle: Some(handle),
                }
            })
            .collect();
        Self { slaves, running }
    }

    pub fn cores(&self) -> usize {
        self.running.len()
    }

    fn send(&self, hart: usize, ipi: Ipi) {
        let slave = &self.slaves[hart - 1];
        // 通道只会在关机时关闭
        if slave.ipi.send_blocking(ipi).is_ok() {
            let _ = slave.ack.recv_blocking();
        }
    }

    pub fn idle(&self, hart: usize) {
        self.send(hart, Ipi::Idle);
    }

    pub fn schedule(&self, hart: usize, tid: Tid) {
        self.send(hart, Ipi::Schedule(tid));
    }

    pub fn running(&self, hart: usize) -> Option<Tid> {
        let tid = self.running[hart].load(Ordering::Acquire);
        (tid != NOTHING).then_some(Tid(tid))
    }
}

impl Drop for Harts {
    fn drop(&mut self) {
        for slave in &self.slaves {
            slave.ipi.close();
        }
        for slave in &mut self.slaves {
            if let Some(handle) = slave.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

fn slave_main(
    hart: usize,
    ipi: &Receiver<Ipi>,
    ack: &Sender<usize>,
    running: &[CachePadded<AtomicUsize>],
) {
    while let Ok(ipi) = ipi.recv_blocking() {
        match ipi {
            Ipi::Idle => running[hart].store(NOTHING, Ordering::Release),
            Ipi::Schedule(tid) => running[hart].store(tid.0, Ordering::Release),
        }
        if ack.send_blocking(hart).is_err() {
            break;
        }
    }
    debug!("hart {hart} stops");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slaves_follow_ipis() {
        let harts = Harts::start(3);
        assert_eq!(harts.cores(), 3);
        assert_eq!(harts.running(1), None);
        harts.schedule(1, Tid(4));
        harts.schedule(2, Tid(5));
        assert_eq!(harts.running(1), Some(Tid(4)));
        assert_eq!(harts.running(2), Some(Tid(5)));
        harts.idle(1);
        assert_eq!(harts.running(1), None);
        assert_eq!(harts.running(2), Some(Tid(5)));
    }

    #[test]
    fn single_core_has_no_slaves() {
        let harts = Harts::start(1);
        assert_eq!(harts.cores(), 1);
        assert!(harts.slaves.is_empty());
    }
}
