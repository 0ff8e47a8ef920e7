use core::{ptr, slice};

use enumflags2::{bitflags, BitFlags};

use crate::SectorId;

/// 名字的最大长度（字节）
pub const NAME_MAX: usize = 26;

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryFlag {
    /// 槽位正在使用；未设置的槽位是墓碑，可被复用
    InUse = 0b01,
    Dir = 0b10,
}

/// 目录文件中的一项
#[derive(Debug, Default, Clone)]
#[repr(C)]
pub struct DirEntry {
    // 最后一字节留给 \0
    name: [u8; NAME_MAX + 1],
    flags: u8,
    sector: u32,
}

impl DirEntry {
    /// 目录项大小恒为32字节
    pub const SIZE: usize = 32;

    #[inline]
    pub fn new(name: &str, sector: SectorId, is_dir: bool) -> Self {
        debug_assert!(Self::is_valid_name(name));
        let bytes = name.as_bytes();
        let mut raw = [0; NAME_MAX + 1];
        raw[..bytes.len()].copy_from_slice(bytes);

        let mut flags = BitFlags::from(EntryFlag::InUse);
        if is_dir {
            flags |= EntryFlag::Dir;
        }

        Self {
            name: raw,
            flags: flags.bits(),
            sector: sector.raw(),
        }
    }

    /// 名字非空、不超长，且不含分隔符与 \0
    pub fn is_valid_name(name: &str) -> bool {
        !name.is_empty() && name.len() <= NAME_MAX && !name.contains(&['/', '\0'][..])
    }

    pub fn name(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..len]).unwrap_or_default()
    }

    #[inline]
    pub fn sector(&self) -> SectorId {
        SectorId::new(self.sector)
    }

    #[inline]
    pub fn flags(&self) -> BitFlags<EntryFlag> {
        BitFlags::from_bits_truncate(self.flags)
    }

    #[inline]
    pub fn is_in_use(&self) -> bool {
        self.flags().contains(EntryFlag::InUse)
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.flags().contains(EntryFlag::Dir)
    }

    /// 标记为墓碑，其余内容原样保留
    #[inline]
    pub fn tombstone(&mut self) {
        self.flags = (self.flags() & !EntryFlag::InUse).bits();
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(ptr::from_ref(self).cast(), Self::SIZE) }
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(ptr::from_mut(self).cast(), Self::SIZE) }
    }
}

const _: () = assert!(core::mem::size_of::<DirEntry>() == DirEntry::SIZE);
