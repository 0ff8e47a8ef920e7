use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::{BlockDevice, BLOCK_SIZE};

/// 内存上的块设备，记录读写次数，便于观察缓存行为
#[derive(Debug)]
pub struct MemDisk {
    blocks: Mutex<Vec<[u8; BLOCK_SIZE]>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemDisk {
    pub fn new(block_count: usize) -> Self {
        Self {
            blocks: Mutex::new(vec![[0; BLOCK_SIZE]; block_count]),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// 设备被读取的次数
    #[inline]
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Acquire)
    }

    /// 设备被写入的次数
    #[inline]
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }

    /// 绕过计数直接查看块内容
    pub fn snapshot(&self, block_id: usize) -> [u8; BLOCK_SIZE] {
        self.blocks.lock()[block_id]
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        assert_eq!(buf.len(), BLOCK_SIZE, "not a complete block!");
        buf.copy_from_slice(&self.blocks.lock()[block_id]);
        self.reads.fetch_add(1, Ordering::AcqRel);
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        assert_eq!(buf.len(), BLOCK_SIZE, "not a complete block!");
        self.blocks.lock()[block_id].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::AcqRel);
    }

    fn block_count(&self) -> usize {
        self.blocks.lock().len()
    }
}
