//! # 磁盘数据结构层
//!
//! sector-fs 的磁盘布局：
//! 根目录索引节点 | 空闲位图 | 索引节点、索引块、目录项、文件数据（按需分配）
//!
//! 除了根目录与位图的位置，扇区的用途只由引用它的索引节点决定。

mod inode;
pub use inode::{
    DiskInode, DiskInodeKind, IndexPath, BLOCK_ENTRIES, DIRECT_COUNT, DOUBLY_COUNT,
    INDIRECT_COUNT, MAIN_ENTRIES, MAX_SECTORS,
};

/// 目录项，也属于磁盘文件系统数据结构
mod dir_entry;
pub use dir_entry::{DirEntry, EntryFlag, NAME_MAX};
