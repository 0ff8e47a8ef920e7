//! # 挂载层
//!
//! 格式化或打开设备上的文件系统，并提供按路径的操作。
//! 磁盘布局：0号扇区是根目录的索引节点，随后是空闲扇区位图，
//! 其余扇区由各自所属的索引节点解释。

use std::sync::Arc;
use std::time::Duration;

use block_dev::BlockDevice;

use crate::config::{DIR_INITIAL_ENTRIES, FLUSH_INTERVAL, ROOT_DIR_ENTRIES, ROOT_DIR_SECTOR};
use crate::{
    Dir, DirEntry, DiskInode, Error, FreeMap, Inode, InodeTable, Path, Result, SectorCache,
};

pub struct FileSystem {
    cache: Arc<SectorCache>,
    free_map: Arc<FreeMap>,
    inodes: Arc<InodeTable>,
}

#[derive(Debug, Clone)]
pub struct MountOptions {
    /// 清空并重建根目录与空闲扇区位图
    pub format: bool,
    /// 启动周期写回与预读任务
    pub background: bool,
    pub flush_interval: Duration,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            format: false,
            background: true,
            flush_interval: FLUSH_INTERVAL,
        }
    }
}

impl FileSystem {
    pub fn init(device: Arc<dyn BlockDevice>, options: MountOptions) -> Result<Self> {
        let total = device.block_count();
        let cache = Arc::new(SectorCache::new(device));

        let (free_map, inodes) = if options.format {
            log::info!("formatting {total} sectors");
            let free_map = Arc::new(FreeMap::format(cache.clone(), total));
            let inodes = InodeTable::new(cache.clone(), free_map.clone());
            Dir::create(&inodes, ROOT_DIR_SECTOR, ROOT_DIR_ENTRIES, ROOT_DIR_SECTOR)?;
            cache.flush_all();
            (free_map, inodes)
        } else {
            // 根目录必须是有效的索引节点
            DiskInode::fetch(&cache, ROOT_DIR_SECTOR);
            let free_map = Arc::new(FreeMap::open(cache.clone(), total));
            let inodes = InodeTable::new(cache.clone(), free_map.clone());
            (free_map, inodes)
        };

        if options.background {
            cache.start_background(options.flush_interval);
        }

        log::info!(
            "mounted: {} of {total} sectors free",
            free_map.free_count()
        );
        Ok(Self {
            cache,
            free_map,
            inodes,
        })
    }

    /// 停止后台任务并写回所有脏扇区，可重复调用
    pub fn shutdown(&self) {
        self.cache.stop_background();
        self.cache.flush_all();
        log::info!("file system flushed");
    }

    #[inline]
    pub fn root(&self) -> Dir {
        Dir::open_root(&self.inodes)
    }

    #[inline]
    pub fn cache(&self) -> &Arc<SectorCache> {
        &self.cache
    }

    #[inline]
    pub fn free_map(&self) -> &Arc<FreeMap> {
        &self.free_map
    }

    #[inline]
    pub fn inodes(&self) -> &Arc<InodeTable> {
        &self.inodes
    }

    /// 创建初始长度为 `initial_size` 的文件
    pub fn create(&self, path: &str, initial_size: usize, cwd: &Dir) -> Result<()> {
        self.create_node(path, cwd, Some(initial_size))
    }

    pub fn create_dir(&self, path: &str, cwd: &Dir) -> Result<()> {
        self.create_node(path, cwd, None)
    }

    pub fn open(&self, path: &str, cwd: &Dir) -> Result<Inode> {
        let found = cwd.resolve(path).ok_or(Error::NotFound)?;
        if found.is_dir {
            return Err(Error::IsADirectory);
        }
        Ok(found.inode)
    }

    pub fn open_dir(&self, path: &str, cwd: &Dir) -> Result<Dir> {
        let found = cwd.resolve(path).ok_or(Error::NotFound)?;
        if !found.is_dir {
            return Err(Error::NotADirectory);
        }
        Ok(Dir::open(found.inode))
    }

    /// 删除文件或空目录。
    ///
    /// 目录仍被文件描述符打开或是某个进程的工作目录时返回 [`Error::Busy`]。
    pub fn remove(&self, path: &str, cwd: &Dir) -> Result<()> {
        let Some((parent, name)) = path.parent_file() else {
            // 根目录不可删除
            return Err(if path.is_absolute() {
                Error::Busy
            } else {
                Error::NotFound
            });
        };
        let parent = self.open_parent(parent, cwd)?;

        // 检查与删除在同一段修改锁内完成
        parent.remove_if(name, |entry, target| {
            if entry.is_dir() && (target.descriptors() > 0 || target.cwd_users() > 0) {
                Err(Error::Busy)
            } else {
                Ok(())
            }
        })
    }
}

impl FileSystem {
    /// `size` 为 `None` 时创建目录
    fn create_node(&self, path: &str, cwd: &Dir, size: Option<usize>) -> Result<()> {
        let (parent, name) = path.parent_file().ok_or(Error::InvalidName)?;
        if !DirEntry::is_valid_name(name) || name == "." || name == ".." {
            return Err(Error::InvalidName);
        }
        let parent = self.open_parent(parent, cwd)?;
        let parent_sector = parent.inode().sector();

        let sector = self.free_map.allocate(1)?;
        let created = match size {
            Some(size) => self.inodes.create(sector, size, parent_sector),
            None => Dir::create(&self.inodes, sector, DIR_INITIAL_ENTRIES, parent_sector),
        };
        if let Err(err) = created {
            self.free_map.release(sector, 1);
            return Err(err);
        }

        if let Err(err) = parent.add(name, sector, size.is_none()) {
            // 关闭时连同头部扇区一并回收
            self.inodes.open(sector).remove();
            return Err(err);
        }

        log::debug!("created {path:?} at sector {sector}");
        Ok(())
    }

    fn open_parent(&self, parent: &str, cwd: &Dir) -> Result<Dir> {
        if parent.is_empty() {
            return Ok(cwd.clone());
        }
        self.open_dir(parent, cwd)
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}
