//! 扇区编号

use derive_more::{Add, Display};

/// 设备上的扇区编号
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Add)]
#[repr(transparent)]
pub struct SectorId(u32);

impl core::ops::Add<u32> for SectorId {
    type Output = Self;

    fn add(self, rhs: u32) -> Self::Output {
        self + Self(rhs)
    }
}

impl SectorId {
    /// 磁盘上表示“无扇区”的编码
    pub const NONE_RAW: u32 = u32::MAX;

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// 交给块设备使用的块ID
    #[inline]
    pub const fn block(self) -> usize {
        self.0 as usize
    }

    /// 解码磁盘上的扇区指针
    #[inline]
    pub fn decode(raw: u32) -> Option<Self> {
        (raw != Self::NONE_RAW).then_some(Self(raw))
    }
}
