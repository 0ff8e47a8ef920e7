/* sector-fs 的整体架构，自上而下 */

// 挂载层：格式化/打开文件系统，提供按路径的创建、打开、删除
mod fs;

// 目录层：以索引节点为底的目录项数组，以及路径解析
mod directory;
mod path;

// 索引节点层：打开的索引节点表、读写、增长与回收
mod inode;

// 空闲扇区位图
mod free_map;

// 磁盘数据结构层：表示磁盘文件系统的数据结构
pub mod layout;

// 扇区缓存层：内存上的扇区数据缓存，写回 + 二次机会淘汰
mod cache;

pub mod config;
mod error;
mod sector;

pub use self::{
    cache::SectorCache,
    directory::{Dir, Resolved},
    error::{Error, Result},
    free_map::FreeMap,
    fs::{FileSystem, MountOptions},
    inode::{Inode, InodeTable, Loaded},
    layout::{DirEntry, DiskInode, DiskInodeKind},
    path::{Components, Path},
    sector::SectorId,
};

pub use block_dev::BlockDevice;

pub const MAGIC: u32 = 0x494e_4f44;
pub const SECTOR_SIZE: usize = block_dev::BLOCK_SIZE;
pub const SECTOR_BITS: usize = SECTOR_SIZE * 8;

type DataSector = [u8; SECTOR_SIZE];
