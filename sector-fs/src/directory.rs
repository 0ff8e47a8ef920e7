//! # 目录层
//!
//! 目录是内容为 [`DirEntry`] 数组的索引节点，经由索引节点层的字节接口读写。
//! 未使用的槽位是墓碑，添加时优先复用。

use std::iter;
use std::sync::Arc;

use crate::config::ROOT_DIR_SECTOR;
use crate::{DirEntry, Error, Inode, InodeTable, Path, Result, SectorId};

/// 打开的目录，带有读取游标
pub struct Dir {
    inode: Inode,
    /// [`Dir::read_next`] 的字节偏移
    pos: usize,
}

/// 路径解析的结果
pub struct Resolved {
    pub inode: Inode,
    pub is_dir: bool,
}

impl Dir {
    /// 在 `sector` 上建立能容纳 `entries` 项的空目录
    pub fn create(
        table: &Arc<InodeTable>,
        sector: SectorId,
        entries: usize,
        parent: SectorId,
    ) -> Result<()> {
        table.create(sector, entries * DirEntry::SIZE, parent)
    }

    #[inline]
    pub fn open(inode: Inode) -> Self {
        Self { inode, pos: 0 }
    }

    #[inline]
    pub fn open_root(table: &Arc<InodeTable>) -> Self {
        Self::open(table.open(ROOT_DIR_SECTOR))
    }

    #[inline]
    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    /// 查找使用中的同名项，返回目录项及其字节偏移
    pub fn lookup(&self, name: &str) -> Option<(DirEntry, usize)> {
        self.entries()
            .find(|(entry, _)| entry.is_in_use() && entry.name() == name)
    }

    pub fn add(&self, name: &str, sector: SectorId, is_dir: bool) -> Result<()> {
        if !DirEntry::is_valid_name(name) {
            return Err(Error::InvalidName);
        }

        let _mutation = self.inode.lock_mutation();
        if self.lookup(name).is_some() {
            return Err(Error::AlreadyExists);
        }

        // 复用第一个墓碑，否则追加到末尾
        let offset = self
            .entries()
            .find(|(entry, _)| !entry.is_in_use())
            .map(|(_, offset)| offset)
            .unwrap_or_else(|| self.inode.length());

        let entry = DirEntry::new(name, sector, is_dir);
        if self.inode.write_at(offset, entry.as_bytes())? != DirEntry::SIZE {
            return Err(Error::NoSpace);
        }

        log::debug!("dir {}: add {name:?} -> {sector} at {offset}", self.inode.sector());
        Ok(())
    }

    /// 把目录项标记为墓碑，并将目标索引节点标记为已删除。
    ///
    /// 子目录必须为空。
    #[inline]
    pub fn remove(&self, name: &str) -> Result<()> {
        self.remove_if(name, |_, _| Ok(()))
    }

    /// 同 [`Dir::remove`]，但先在修改锁内对目标执行 `check`，
    /// 它返回错误时目录项与目标都保持原样。
    pub fn remove_if(
        &self,
        name: &str,
        check: impl FnOnce(&DirEntry, &Inode) -> Result<()>,
    ) -> Result<()> {
        let _mutation = self.inode.lock_mutation();
        let (mut entry, offset) = self.lookup(name).ok_or(Error::NotFound)?;

        let target = self.inode.table().open(entry.sector());
        check(&entry, &target)?;
        if entry.is_dir() && !Dir::open(target.clone()).is_empty() {
            return Err(Error::DirectoryNotEmpty);
        }

        entry.tombstone();
        self.inode.write_at(offset, entry.as_bytes())?;
        target.remove();

        log::debug!("dir {}: remove {name:?}", self.inode.sector());
        Ok(())
    }

    /// 没有使用中的目录项
    pub fn is_empty(&self) -> bool {
        !self.entries().any(|(entry, _)| entry.is_in_use())
    }

    /// 返回下一个使用中的目录项名，跳过墓碑
    pub fn read_next(&mut self) -> Option<String> {
        loop {
            let mut entry = DirEntry::default();
            if self.inode.read_at(self.pos, entry.as_bytes_mut()) != DirEntry::SIZE {
                return None;
            }
            self.pos += DirEntry::SIZE;
            if entry.is_in_use() {
                return Some(entry.name().to_owned());
            }
        }
    }

    /// 从本目录出发解析路径，绝对路径从根目录出发。
    ///
    /// `.` 不移动，`..` 移到索引节点记录的父目录；
    /// 其余项必须在当前目录中找到，否则解析失败。
    pub fn resolve(&self, path: &str) -> Option<Resolved> {
        if path.is_empty() {
            return None;
        }

        let table = self.inode.table();
        let mut current = if path.is_absolute() {
            table.open(ROOT_DIR_SECTOR)
        } else {
            self.inode.clone()
        };
        let mut is_dir = true;

        for cmp in path.components() {
            match cmp {
                "." => (),
                ".." => {
                    current = table.open(current.parent());
                    is_dir = true;
                }
                name => {
                    if !is_dir {
                        return None;
                    }
                    let (entry, _) = Dir::open(current).lookup(name)?;
                    current = table.open(entry.sector());
                    is_dir = entry.is_dir();
                }
            }
        }

        Some(Resolved {
            inode: current,
            is_dir,
        })
    }
}

impl Dir {
    /// 依次读出所有槽位及其偏移
    fn entries(&self) -> impl Iterator<Item = (DirEntry, usize)> + '_ {
        let mut offset = 0;
        iter::from_fn(move || {
            let mut entry = DirEntry::default();
            if self.inode.read_at(offset, entry.as_bytes_mut()) != DirEntry::SIZE {
                return None;
            }
            offset += DirEntry::SIZE;
            Some((entry, offset - DirEntry::SIZE))
        })
    }
}

impl Clone for Dir {
    /// 重新打开，游标从头开始
    fn clone(&self) -> Self {
        Self::open(self.inode.clone())
    }
}
