use std::collections::BTreeMap;

use defines::{
    config::BLOCK_SIZE,
    error::{errno, KResult},
};
use klocks::SpinMutex;

use crate::fs::{BlockDevice, Buffer, BufferCache};

/// 稀疏的内存块设备，未写过的块读出全零。同时充当自身的块缓冲层
pub struct RamDisk {
    dev: usize,
    capacity: usize,
    blocks: SpinMutex<BTreeMap<usize, Box<[u8]>>>,
}

impl RamDisk {
    /// `capacity` 以字节计
    pub fn new(dev: usize, capacity: usize) -> Self {
        Self {
            dev,
            capacity,
            blocks: SpinMutex::new(BTreeMap::new()),
        }
    }

    pub fn dev(&self) -> usize {
        self.dev
    }

    /// 直接写入一整块，用于准备文件内容
    pub fn write_block(&self, block: usize, data: &[u8]) -> KResult<()> {
        if data.len() > BLOCK_SIZE {
            return Err(errno::EINVAL);
        }
        self.write_at(block * BLOCK_SIZE, data)
    }

    fn check_range(&self, offset: usize, len: usize) -> KResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => {
                warn!("ramdisk access {offset:#x}+{len:#x} out of range");
                Err(errno::EIO)
            }
        }
    }
}

impl BlockDevice for RamDisk {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> KResult<()> {
        self.check_range(offset, buf.len())?;
        let blocks = self.blocks.lock();
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done;
            let in_block = pos % BLOCK_SIZE;
            let len = (BLOCK_SIZE - in_block).min(buf.len() - done);
            let dst = &mut buf[done..done + len];
            match blocks.get(&(pos / BLOCK_SIZE)) {
                Some(block) => dst.copy_from_slice(&block[in_block..in_block + len]),
                None => dst.fill(0),
            }
            done += len;
        }
        Ok(())
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> KResult<()> {
        self.check_range(offset, buf.len())?;
        let mut blocks = self.blocks.lock();
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done;
            let in_block = pos % BLOCK_SIZE;
            let len = (BLOCK_SIZE - in_block).min(buf.len() - done);
            let block = blocks
                .entry(pos / BLOCK_SIZE)
                .or_insert_with(|| vec![0; BLOCK_SIZE].into_boxed_slice());
            block[in_block..in_block + len].copy_from_slice(&buf[done..done + len]);
            done += len;
        }
        Ok(())
    }
}

impl BufferCache for RamDisk {
    fn bread(&self, dev: usize, block: usize) -> KResult<Buffer> {
        if dev != self.dev {
            return Err(errno::EIO);
        }
        let mut data = vec![0; BLOCK_SIZE].into_boxed_slice();
        self.read_at(block * BLOCK_SIZE, &mut data)?;
        Ok(Buffer::new(dev, block, data))
    }

    fn brelse(&self, buf: Buffer) {
        if buf.is_dirty() && self.write_at(buf.block() * BLOCK_SIZE, buf.data()).is_err() {
            error!("failed to write back block {}", buf.block());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwritten_blocks_read_as_zero() {
        let disk = RamDisk::new(0, 16 * BLOCK_SIZE);
        let mut buf = [0xffu8; 100];
        disk.read_at(3 * BLOCK_SIZE + 7, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn writes_span_block_boundaries() {
        let disk = RamDisk::new(0, 16 * BLOCK_SIZE);
        let data: Vec<u8> = (0..=255).cycle().take(BLOCK_SIZE + 300).collect();
        disk.write_at(BLOCK_SIZE - 100, &data).unwrap();
        let mut back = vec![0; data.len()];
        disk.read_at(BLOCK_SIZE - 100, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn out_of_range_is_io_error() {
        let disk = RamDisk::new(0, BLOCK_SIZE);
        assert_eq!(disk.write_at(BLOCK_SIZE - 1, &[0, 0]), Err(errno::EIO));
    }

    #[test]
    fn dirty_buffers_are_written_back() {
        let disk = RamDisk::new(4, 8 * BLOCK_SIZE);
        let mut buf = disk.bread(4, 2).unwrap();
        buf.data_mut()[..5].copy_from_slice(b"hello");
        disk.brelse(buf);
        let buf = disk.bread(4, 2).unwrap();
        assert_eq!(&buf.data()[..5], b"hello");
        disk.brelse(buf);
        assert_eq!(disk.bread(5, 2).unwrap_err(), errno::EIO);
    }
}
