#[cfg(test)]
mod tests;

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

use block_dev::{BlockDevice, BLOCK_SIZE};

/// 以宿主文件为存储的块设备，镜像长度必须是整数个块
#[derive(Debug)]
pub struct BlockFile {
    file: Mutex<File>,
    /// 打开时确定的总块数，镜像不会在使用中改变大小
    blocks: usize,
}

impl BlockFile {
    pub fn new(fd: File) -> io::Result<Self> {
        let len = fd.metadata()?.len() as usize;
        if len % BLOCK_SIZE != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("image of {len} bytes is not a whole number of {BLOCK_SIZE}-byte blocks"),
            ));
        }

        Ok(Self {
            file: Mutex::new(fd),
            blocks: len / BLOCK_SIZE,
        })
    }

    /// 定位到块的起始处
    fn seek_to(file: &mut File, block_id: usize) {
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .expect("seeking error");
    }
}

impl BlockDevice for BlockFile {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        assert!(block_id < self.blocks, "block {block_id} is out of the image");
        let mut file = self.file.lock().unwrap();
        Self::seek_to(&mut file, block_id);
        file.read_exact(buf).expect("not a complete block!");
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        assert!(block_id < self.blocks, "block {block_id} is out of the image");
        let mut file = self.file.lock().unwrap();
        Self::seek_to(&mut file, block_id);
        file.write_all(buf).expect("not a complete block!");
    }

    #[inline]
    fn block_count(&self) -> usize {
        self.blocks
    }
}
