//! 子系统所依赖的文件系统层接口
//!
//! 文件系统本身不在此实现，这里只定义缺页填充与交换所需要的最小契约，以及测试用的内存实现

use defines::{config::BLOCK_SIZE, error::KResult};

/// 按字节偏移读写的块设备，交换区直接使用
pub trait BlockDevice: Send + Sync {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> KResult<()>;
    fn write_at(&self, offset: usize, buf: &[u8]) -> KResult<()>;
}

/// 块缓冲层。`bread` 得到的缓冲区必须通过 `brelse` 归还
pub trait BufferCache: Send + Sync {
    fn bread(&self, dev: usize, block: usize) -> KResult<Buffer>;
    fn brelse(&self, buf: Buffer);
}

/// 文件系统 inode 的只读视图。引用计数即 `Arc<dyn Inode>` 的强引用计数
pub trait Inode: Send + Sync {
    fn dev(&self) -> usize;
    fn ino(&self) -> usize;
    fn size(&self) -> usize;
    /// 文件内第 `file_block` 块所在的设备块号，空洞返回 `None`
    fn bmap(&self, file_block: usize) -> Option<usize>;
}

/// 一个块大小的缓冲区
#[derive(Debug)]
pub struct Buffer {
    dev: usize,
    block: usize,
    dirty: bool,
    data: Box<[u8]>,
}

impl Buffer {
    pub fn new(dev: usize, block: usize, data: Box<[u8]>) -> Self {
        debug_assert_eq!(data.len(), BLOCK_SIZE);
        Self {
            dev,
            block,
            dirty: false,
            data,
        }
    }

    pub fn dev(&self) -> usize {
        self.dev
    }

    pub fn block(&self) -> usize {
        self.block
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// 取得可写引用会将缓冲区标记为脏，`brelse` 时写回
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.data
    }
}

/// 内容放在某块设备上的内存 inode，块号表在创建时给定
pub struct MemInode {
    dev: usize,
    ino: usize,
    size: usize,
    blocks: Vec<Option<usize>>,
}

impl MemInode {
    pub fn new(dev: usize, ino: usize, size: usize, blocks: Vec<Option<usize>>) -> Self {
        Self {
            dev,
            ino,
            size,
            blocks,
        }
    }
}

impl Inode for MemInode {
    fn dev(&self) -> usize {
        self.dev
    }

    fn ino(&self) -> usize {
        self.ino
    }

    fn size(&self) -> usize {
        self.size
    }

    fn bmap(&self, file_block: usize) -> Option<usize> {
        self.blocks.get(file_block).copied().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bmap_reports_holes() {
        let inode = MemInode::new(0, 2, 3 * BLOCK_SIZE, vec![Some(10), None, Some(12)]);
        assert_eq!(inode.bmap(0), Some(10));
        assert_eq!(inode.bmap(1), None);
        assert_eq!(inode.bmap(3), None);
        assert_eq!(inode.size(), 3 * BLOCK_SIZE);
    }

    #[test]
    fn writing_marks_buffer_dirty() {
        let mut buf = Buffer::new(0, 1, vec![0; BLOCK_SIZE].into_boxed_slice());
        assert!(!buf.is_dirty());
        buf.data_mut()[0] = 1;
        assert!(buf.is_dirty());
        assert_eq!(buf.data()[0], 1);
    }
}
