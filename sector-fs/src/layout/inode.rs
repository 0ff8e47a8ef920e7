//! 磁盘索引节点
//!
//! 一个索引节点恰好占一个扇区。索引区有两种解释：
//! - 数据索引节点：主索引，依次是直接、一级间接、二级间接三段；
//! - 索引块：只有 [`BLOCK_ENTRIES`] 个子扇区指针。
//!
//! 由 `kind` 字段区分，访问错误的解释会触发断言。
//!
//! ## 块索引编码
//!
//! - 逻辑扇区号减去前面各段的容量，得到段内序号；
//! - 段内序号除以下一级的容量得到本级槽位，取模得到下一级内的位置。

use core::{mem, ptr, slice};

use crate::{SectorCache, SectorId, MAGIC, SECTOR_SIZE};

/// 直接索引的槽位数
pub const DIRECT_COUNT: usize = 11;
/// 一级间接索引的槽位数
pub const INDIRECT_COUNT: usize = 65;
/// 二级间接索引的槽位数
pub const DOUBLY_COUNT: usize = 3;
/// 主索引总槽位数
pub const MAIN_ENTRIES: usize = DIRECT_COUNT + INDIRECT_COUNT + DOUBLY_COUNT;
/// 索引块的子指针数
pub const BLOCK_ENTRIES: usize = 64;

/// 直接索引时的编号容量
const DIRECT_CAP: usize = DIRECT_COUNT;
/// 用上一级索引时的编号容量
const INDIRECT_CAP: usize = DIRECT_CAP + INDIRECT_COUNT * BLOCK_ENTRIES;
/// 用上二级索引时的编号容量，即单个文件最多的数据扇区数
pub const MAX_SECTORS: usize = INDIRECT_CAP + DOUBLY_COUNT * BLOCK_ENTRIES * BLOCK_ENTRIES;

/// 把扇区填满所需的保留字
const RESERVED: usize = SECTOR_SIZE / 4 - 5 - MAIN_ENTRIES;

#[repr(C)]
pub struct DiskInode {
    /// 首个数据扇区，与 `index[0]` 相同
    start: u32,
    /// 所在目录的索引节点扇区
    parent: u32,
    /// 逻辑长度（字节），不用usize是为了严控布局
    length: u32,
    index: [u32; MAIN_ENTRIES],
    kind: u32,
    magic: u32,
    _reserved: [u32; RESERVED],
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskInodeKind {
    Data = 0,
    IndexBlock = 1,
}

/// 逻辑扇区在索引树中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPath {
    Direct { slot: usize },
    Indirect { slot: usize, child: usize },
    Doubly { slot: usize, mid: usize, leaf: usize },
}

impl DiskInodeKind {
    #[inline]
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Data),
            1 => Some(Self::IndexBlock),
            _ => None,
        }
    }
}

impl IndexPath {
    /// 逻辑扇区号 -> 索引路径。
    ///
    /// 超出格式所能表示的最大扇区数是无法恢复的错误。
    pub fn locate(logical: usize) -> Self {
        if logical < DIRECT_CAP {
            Self::Direct { slot: logical }
        } else if logical < INDIRECT_CAP {
            // 剔去直接索引的部分
            let index = logical - DIRECT_CAP;
            Self::Indirect {
                slot: DIRECT_COUNT + index / BLOCK_ENTRIES,
                child: index % BLOCK_ENTRIES,
            }
        } else if logical < MAX_SECTORS {
            // 剔去使用了一级索引的部分
            let index = logical - INDIRECT_CAP;
            Self::Doubly {
                slot: DIRECT_COUNT + INDIRECT_COUNT + index / BLOCK_ENTRIES.pow(2),
                mid: index / BLOCK_ENTRIES % BLOCK_ENTRIES,
                leaf: index % BLOCK_ENTRIES,
            }
        } else {
            log::error!("logical sector {logical} exceeds the maximum of {MAX_SECTORS}");
            panic!("file cannot grow past {MAX_SECTORS} sectors");
        }
    }
}

impl DiskInode {
    fn blank(kind: DiskInodeKind) -> Self {
        Self {
            start: SectorId::NONE_RAW,
            parent: SectorId::NONE_RAW,
            length: 0,
            index: [SectorId::NONE_RAW; MAIN_ENTRIES],
            kind: kind as u32,
            magic: MAGIC,
            _reserved: [0; RESERVED],
        }
    }

    /// 数据索引节点，首个数据扇区已绑定
    pub fn data(start: SectorId, parent: SectorId, length: usize) -> Self {
        let mut inode = Self::blank(DiskInodeKind::Data);
        inode.start = start.raw();
        inode.index[0] = start.raw();
        inode.parent = parent.raw();
        inode.length = length as u32;
        inode
    }

    /// 所有子指针为空的索引块
    pub fn index_block() -> Self {
        Self::blank(DiskInodeKind::IndexBlock)
    }

    /// 从缓存读出并校验
    pub fn fetch(cache: &SectorCache, sector: SectorId) -> Box<Self> {
        let mut inode = Box::new(Self::blank(DiskInodeKind::Data));
        cache.read(sector, 0, inode.as_bytes_mut());
        inode.check(sector);
        inode
    }

    #[inline]
    pub fn store(&self, cache: &SectorCache, sector: SectorId) {
        cache.write(sector, 0, self.as_bytes());
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC && DiskInodeKind::from_raw(self.kind).is_some()
    }

    pub fn kind(&self) -> DiskInodeKind {
        DiskInodeKind::from_raw(self.kind).unwrap_or_else(|| {
            panic!("corrupted inode kind {:#x}", self.kind);
        })
    }

    #[inline]
    pub fn parent(&self) -> SectorId {
        SectorId::new(self.parent)
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.length as usize
    }

    #[inline]
    pub fn set_length(&mut self, length: usize) {
        self.length = length as u32;
    }

    /// 主索引，只有数据索引节点才有
    pub fn main_index(&self) -> &[u32] {
        self.expect_kind(DiskInodeKind::Data);
        &self.index
    }

    pub fn main_index_mut(&mut self) -> &mut [u32] {
        self.expect_kind(DiskInodeKind::Data);
        &mut self.index
    }

    /// 子指针，只有索引块才有
    pub fn children(&self) -> &[u32] {
        self.expect_kind(DiskInodeKind::IndexBlock);
        &self.index[..BLOCK_ENTRIES]
    }

    pub fn children_mut(&mut self) -> &mut [u32] {
        self.expect_kind(DiskInodeKind::IndexBlock);
        &mut self.index[..BLOCK_ENTRIES]
    }

    /// 计算容纳指定数据量需要多少个**数据扇区**
    #[inline]
    pub fn count_data_sectors(length: usize) -> usize {
        length.div_ceil(SECTOR_SIZE)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(ptr::from_ref(self).cast(), SECTOR_SIZE) }
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(ptr::from_mut(self).cast(), SECTOR_SIZE) }
    }
}

impl DiskInode {
    fn check(&self, sector: SectorId) {
        if !self.is_valid() {
            log::error!(
                "sector {sector} holds no inode: magic={:#x} kind={:#x}",
                self.magic,
                self.kind
            );
            panic!("corrupted inode at sector {sector}");
        }
    }

    fn expect_kind(&self, kind: DiskInodeKind) {
        assert_eq!(kind, self.kind(), "index region accessed as the wrong variant");
    }
}

// 索引节点必须恰好占一个扇区
const _: () = assert!(mem::size_of::<DiskInode>() == SECTOR_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_boundaries() {
        assert_eq!(IndexPath::Direct { slot: 10 }, IndexPath::locate(10));
        assert_eq!(
            IndexPath::Indirect { slot: 11, child: 0 },
            IndexPath::locate(11)
        );
        assert_eq!(
            IndexPath::Indirect { slot: 11, child: 63 },
            IndexPath::locate(74)
        );
        assert_eq!(
            IndexPath::Indirect { slot: 12, child: 0 },
            IndexPath::locate(75)
        );
        assert_eq!(
            IndexPath::Indirect {
                slot: MAIN_ENTRIES - DOUBLY_COUNT - 1,
                child: 63
            },
            IndexPath::locate(INDIRECT_CAP - 1)
        );
        assert_eq!(
            IndexPath::Doubly {
                slot: 76,
                mid: 0,
                leaf: 0
            },
            IndexPath::locate(INDIRECT_CAP)
        );
        assert_eq!(
            IndexPath::Doubly {
                slot: 76,
                mid: 1,
                leaf: 0
            },
            IndexPath::locate(INDIRECT_CAP + 64)
        );
        assert_eq!(
            IndexPath::Doubly {
                slot: 78,
                mid: 63,
                leaf: 63
            },
            IndexPath::locate(MAX_SECTORS - 1)
        );
    }

    #[test]
    #[should_panic]
    fn past_maximum_is_fatal() {
        IndexPath::locate(MAX_SECTORS);
    }

    #[test]
    fn variants_are_tagged() {
        let data = DiskInode::data(SectorId::new(9), SectorId::new(0), 100);
        assert_eq!(DiskInodeKind::Data, data.kind());
        assert_eq!(MAIN_ENTRIES, data.main_index().len());
        assert_eq!(Some(SectorId::new(9)), SectorId::decode(data.main_index()[0]));

        let block = DiskInode::index_block();
        assert_eq!(DiskInodeKind::IndexBlock, block.kind());
        assert_eq!(BLOCK_ENTRIES, block.children().len());
        assert!(block.children().iter().all(|&raw| SectorId::decode(raw).is_none()));
    }

    #[test]
    #[should_panic(expected = "wrong variant")]
    fn wrong_variant_is_checked() {
        DiskInode::index_block().main_index();
    }
}
