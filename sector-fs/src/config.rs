//! 文件系统用到的常量

use core::time::Duration;

use crate::SectorId;

/// 缓存槽位数
pub const CACHE_CAPACITY: usize = 64;
/// 预读队列容量
pub const READ_AHEAD_CAPACITY: usize = 10;
/// 后台写回的周期
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(1000);
/// 淘汰扫描跳过被占用槽位的最大轮数，之后改为阻塞等待
pub const MAX_SKIP_SWEEPS: usize = 5;

/// 根目录的索引节点所在扇区
pub const ROOT_DIR_SECTOR: SectorId = SectorId::new(0);
/// 空闲位图的起始扇区，紧随根目录之后
pub const FREE_MAP_START: SectorId = SectorId::new(1);
/// 格式化时根目录预留的目录项数
pub const ROOT_DIR_ENTRIES: usize = 16;
/// 新建目录预留的目录项数
pub const DIR_INITIAL_ENTRIES: usize = 10;
