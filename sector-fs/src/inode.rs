//! # 索引节点层
//!
//! 打开的索引节点登记在 [`InodeTable`] 中，同一扇区在内存里只有一份状态，
//! 所有句柄共享它。
//!
//! - [`Inode`] 是打开者句柄：克隆即重新打开，析构即关闭；
//! - [`Loaded`] 是加载守卫：首次加载时从扇区缓存读入记录，
//!   最后一次释放时写回，可在一个打开周期内嵌套。
//!
//! 字节偏移经由三级索引解析为扇区，解析有两种模式：
//! 读模式遇到缺失的链接即返回 `None`，分配模式会补齐缺失的索引块与数据扇区。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::MutexGuard;

use crate::layout::{DiskInode, IndexPath, DIRECT_COUNT, INDIRECT_COUNT};
use crate::{FreeMap, Result, SectorCache, SectorId, SECTOR_SIZE};

/// 打开的索引节点表
pub struct InodeTable {
    cache: Arc<SectorCache>,
    free_map: Arc<FreeMap>,
    open: spin::Mutex<BTreeMap<SectorId, Arc<InodeState>>>,
}

/// 内存中的索引节点，被同一扇区的所有句柄共享
struct InodeState {
    sector: SectorId,
    /// 打开者数，只在持有注册表锁时修改
    openers: AtomicUsize,
    /// 以文件描述符打开的次数
    descriptors: AtomicUsize,
    /// 以之为工作目录的进程数
    cwd_users: AtomicUsize,
    /// 已从目录中删除，最后一个打开者关闭时回收
    removed: AtomicBool,
    deny_write: AtomicUsize,
    /// 嵌套加载次数
    access: parking_lot::Mutex<usize>,
    record: spin::RwLock<Option<Box<DiskInode>>>,
    growth: parking_lot::Mutex<()>,
    /// 目录项的修改锁
    mutation: parking_lot::Mutex<()>,
}

/// 打开的索引节点
pub struct Inode {
    table: Arc<InodeTable>,
    state: Arc<InodeState>,
}

/// 加载守卫，析构时释放
pub struct Loaded<'a> {
    inode: &'a Inode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolve {
    Read,
    Allocate,
}

impl InodeTable {
    pub fn new(cache: Arc<SectorCache>, free_map: Arc<FreeMap>) -> Arc<Self> {
        Arc::new(Self {
            cache,
            free_map,
            open: spin::Mutex::new(BTreeMap::new()),
        })
    }

    #[inline]
    pub fn cache(&self) -> &Arc<SectorCache> {
        &self.cache
    }

    #[inline]
    pub fn free_map(&self) -> &Arc<FreeMap> {
        &self.free_map
    }

    /// 在 `sector` 上建立数据索引节点，初始长度为 `length`。
    ///
    /// 首个数据扇区立即绑定。失败时此处分配的扇区全部归还，
    /// `sector` 本身仍归调用者所有。
    pub fn create(self: &Arc<Self>, sector: SectorId, length: usize, parent: SectorId) -> Result<()> {
        let start = self.free_map.allocate(1)?;
        self.cache.zero(start);
        DiskInode::data(start, parent, length.min(SECTOR_SIZE)).store(&self.cache, sector);

        if length > SECTOR_SIZE {
            let inode = self.open(sector);
            if let Err(err) = inode.grow(length, 0) {
                log::debug!("cannot grow new inode {sector} to {length} bytes: {err}");
                inode.release_contents();
                return Err(err);
            }
        }

        log::debug!("created inode {sector} with parent {parent}, length {length}");
        Ok(())
    }

    /// 在 `sector` 上建立子指针全空的索引块
    pub fn create_index_block(&self, sector: SectorId) {
        DiskInode::index_block().store(&self.cache, sector);
    }

    pub fn open(self: &Arc<Self>, sector: SectorId) -> Inode {
        let mut open = self.open.lock();
        let state = open
            .entry(sector)
            .or_insert_with(|| {
                log::debug!("inode {sector} enters the open table");
                Arc::new(InodeState::new(sector))
            })
            .clone();
        state.openers.fetch_add(1, Ordering::Relaxed);

        Inode {
            table: self.clone(),
            state,
        }
    }

    /// 扇区上的索引节点当前是否打开
    pub fn is_open(&self, sector: SectorId) -> bool {
        self.open.lock().contains_key(&sector)
    }

    /// 打开的索引节点数
    pub fn open_count(&self) -> usize {
        self.open.lock().len()
    }
}

impl Inode {
    #[inline]
    pub fn sector(&self) -> SectorId {
        self.state.sector
    }

    #[inline]
    pub(crate) fn table(&self) -> &Arc<InodeTable> {
        &self.table
    }

    /// 当前的打开者数
    #[inline]
    pub fn openers(&self) -> usize {
        self.state.openers.load(Ordering::Relaxed)
    }

    pub fn load(&self) -> Loaded<'_> {
        let mut access = self.state.access.lock();
        if *access == 0 {
            let record = DiskInode::fetch(&self.table.cache, self.state.sector);
            *self.state.record.write() = Some(record);
        }
        *access += 1;

        Loaded { inode: self }
    }

    /// 已发布的逻辑长度
    pub fn length(&self) -> usize {
        self.load().read(DiskInode::length)
    }

    /// 所在目录的索引节点扇区
    pub fn parent(&self) -> SectorId {
        self.load().read(DiskInode::parent)
    }

    /// 读模式解析：`offset` 所在的扇区，链接缺失则为 `None`
    pub fn sector_at(&self, offset: usize) -> Option<SectorId> {
        let loaded = self.load();
        self.resolve(&loaded, offset / SECTOR_SIZE, Resolve::Read)
            .ok()
            .flatten()
    }

    /// 分配模式解析：补齐路径上缺失的索引块与数据扇区
    pub fn allocate_sector_at(&self, offset: usize) -> Result<SectorId> {
        let _growth = self.state.growth.lock();
        let loaded = self.load();
        let sector = self.resolve(&loaded, offset / SECTOR_SIZE, Resolve::Allocate)?;
        Ok(sector.unwrap_or_else(|| unreachable!("allocation leaves no missing link")))
    }

    /// 保证 `[0, offset + size)` 都有扇区，然后把逻辑长度推进到 `offset + size`。
    ///
    /// 长度只会增加，且在扇区全部绑定之后才发布。
    pub fn grow(&self, size: usize, offset: usize) -> Result<()> {
        let _growth = self.state.growth.lock();
        let loaded = self.load();
        let end = offset + size;
        self.bind_through(&loaded, end)?;
        loaded.modify(|record| record.set_length(record.length().max(end)));
        Ok(())
    }

    /// 从 `offset` 读到 `buf`，返回读到的字节数。不会读过逻辑长度
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let loaded = self.load();
        let length = loaded.read(DiskInode::length);

        let mut read = 0;
        while read < buf.len() {
            let pos = offset + read;
            if pos >= length {
                break;
            }
            let logical = pos / SECTOR_SIZE;
            let Ok(Some(sector)) = self.resolve(&loaded, logical, Resolve::Read) else {
                break;
            };

            let in_sector = pos % SECTOR_SIZE;
            let chunk = (buf.len() - read)
                .min(SECTOR_SIZE - in_sector)
                .min(length - pos);
            self.table
                .cache
                .read(sector, in_sector, &mut buf[read..read + chunk]);
            read += chunk;

            // 下一个逻辑扇区很可能马上被读到
            if (logical + 1) * SECTOR_SIZE < length {
                if let Ok(Some(next)) = self.resolve(&loaded, logical + 1, Resolve::Read) {
                    self.table.cache.request_read_ahead(next);
                }
            }
        }

        read
    }

    /// 把 `buf` 写到 `offset`，返回写入的字节数。
    ///
    /// 禁止写入时返回 0；越过文件末尾时就地增长，
    /// 数据写完之后才发布新的长度。
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() || self.is_write_denied() {
            return Ok(0);
        }

        let end = offset + buf.len();
        let loaded = self.load();
        if end <= loaded.read(DiskInode::length) {
            return Ok(self.write_sectors(&loaded, offset, buf));
        }

        let _growth = self.state.growth.lock();
        self.bind_through(&loaded, end)?;
        let written = self.write_sectors(&loaded, offset, buf);
        loaded.modify(|record| record.set_length(record.length().max(offset + written)));
        Ok(written)
    }

    /// 标记为已删除，最后一个打开者关闭时回收全部扇区
    #[inline]
    pub fn remove(&self) {
        log::debug!("inode {} marked removed", self.state.sector);
        self.state.removed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_removed(&self) -> bool {
        self.state.removed.load(Ordering::Acquire)
    }

    /// 可执行映像运行期间禁止写入，可嵌套
    #[inline]
    pub fn deny_write(&self) {
        self.state.deny_write.fetch_add(1, Ordering::AcqRel);
    }

    pub fn allow_write(&self) {
        let prev = self.state.deny_write.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "allow_write without a matching deny_write");
    }

    #[inline]
    pub fn is_write_denied(&self) -> bool {
        self.state.deny_write.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub fn attach_descriptor(&self) {
        self.state.descriptors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn detach_descriptor(&self) {
        let prev = self.state.descriptors.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0);
    }

    #[inline]
    pub fn descriptors(&self) -> usize {
        self.state.descriptors.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn enter_cwd(&self) {
        self.state.cwd_users.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn leave_cwd(&self) {
        let prev = self.state.cwd_users.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0);
    }

    #[inline]
    pub fn cwd_users(&self) -> usize {
        self.state.cwd_users.load(Ordering::Relaxed)
    }

    /// 目录项修改锁，同一目录的所有句柄共享
    #[inline]
    pub(crate) fn lock_mutation(&self) -> MutexGuard<'_, ()> {
        self.state.mutation.lock()
    }
}

impl Inode {
    /// 逻辑扇区号 -> 扇区
    fn resolve(
        &self,
        loaded: &Loaded<'_>,
        logical: usize,
        mode: Resolve,
    ) -> Result<Option<SectorId>> {
        let (slot, steps, depth) = match IndexPath::locate(logical) {
            IndexPath::Direct { slot } => (slot, [0, 0], 0),
            IndexPath::Indirect { slot, child } => (slot, [child, 0], 1),
            IndexPath::Doubly { slot, mid, leaf } => (slot, [mid, leaf], 2),
        };

        let mut current = self.main_link(loaded, slot, depth == 0, mode)?;
        for (level, &pos) in steps[..depth].iter().enumerate() {
            let Some(block) = current else {
                return Ok(None);
            };
            current = self.child_link(block, pos, level + 1 == depth, mode)?;
        }

        Ok(current)
    }

    fn main_link(
        &self,
        loaded: &Loaded<'_>,
        slot: usize,
        leaf: bool,
        mode: Resolve,
    ) -> Result<Option<SectorId>> {
        let link = loaded.read(|record| SectorId::decode(record.main_index()[slot]));
        if link.is_some() || mode == Resolve::Read {
            return Ok(link);
        }

        let sector = self.allocate_node(leaf)?;
        loaded.modify(|record| record.main_index_mut()[slot] = sector.raw());
        Ok(Some(sector))
    }

    fn child_link(
        &self,
        block: SectorId,
        pos: usize,
        leaf: bool,
        mode: Resolve,
    ) -> Result<Option<SectorId>> {
        let cache = &self.table.cache;
        let mut node = DiskInode::fetch(cache, block);
        let link = SectorId::decode(node.children()[pos]);
        if link.is_some() || mode == Resolve::Read {
            return Ok(link);
        }

        let sector = self.allocate_node(leaf)?;
        node.children_mut()[pos] = sector.raw();
        node.store(cache, block);
        Ok(Some(sector))
    }

    /// 分配数据扇区（清零）或索引块
    fn allocate_node(&self, leaf: bool) -> Result<SectorId> {
        let sector = self.table.free_map.allocate(1)?;
        if leaf {
            self.table.cache.zero(sector);
        } else {
            self.table.create_index_block(sector);
        }
        Ok(sector)
    }

    /// 绑定 `[长度, end)` 所涉及的全部逻辑扇区，调用者持有增长锁
    fn bind_through(&self, loaded: &Loaded<'_>, end: usize) -> Result<()> {
        let length = loaded.read(DiskInode::length);
        let first = DiskInode::count_data_sectors(length);
        let last = DiskInode::count_data_sectors(end);
        for logical in first..last {
            self.resolve(loaded, logical, Resolve::Allocate)?;
        }
        Ok(())
    }

    fn write_sectors(&self, loaded: &Loaded<'_>, offset: usize, buf: &[u8]) -> usize {
        let mut written = 0;
        while written < buf.len() {
            let pos = offset + written;
            let Ok(Some(sector)) = self.resolve(loaded, pos / SECTOR_SIZE, Resolve::Read) else {
                break;
            };

            let in_sector = pos % SECTOR_SIZE;
            let chunk = (buf.len() - written).min(SECTOR_SIZE - in_sector);
            self.table
                .cache
                .write(sector, in_sector, &buf[written..written + chunk]);
            written += chunk;
        }

        written
    }

    /// 归还全部数据扇区与索引块，不含头部扇区
    fn release_contents(&self) {
        let loaded = self.load();
        let links: Vec<_> = loaded.read(|record| {
            record
                .main_index()
                .iter()
                .map(|&raw| SectorId::decode(raw))
                .collect()
        });

        for (slot, link) in links.into_iter().enumerate() {
            let Some(sector) = link else {
                continue;
            };
            let depth = if slot < DIRECT_COUNT {
                0
            } else if slot < DIRECT_COUNT + INDIRECT_COUNT {
                1
            } else {
                2
            };
            self.release_tree(sector, depth);
        }

        loaded.modify(|record| record.main_index_mut().fill(SectorId::NONE_RAW));
    }

    fn release_tree(&self, sector: SectorId, depth: usize) {
        if depth > 0 {
            let node = DiskInode::fetch(&self.table.cache, sector);
            for child in node.children().iter().filter_map(|&raw| SectorId::decode(raw)) {
                self.release_tree(child, depth - 1);
            }
        }
        self.table.free_map.release(sector, 1);
    }
}

impl Clone for Inode {
    /// 重新打开
    fn clone(&self) -> Self {
        let _open = self.table.open.lock();
        self.state.openers.fetch_add(1, Ordering::Relaxed);

        Self {
            table: self.table.clone(),
            state: self.state.clone(),
        }
    }
}

impl Drop for Inode {
    /// 关闭，最后一个打开者离开注册表，若已删除则回收全部扇区
    fn drop(&mut self) {
        let mut open = self.table.open.lock();
        if self.state.openers.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        open.remove(&self.state.sector);
        drop(open);

        let sector = self.state.sector;
        log::debug!("inode {sector} leaves the open table");
        if self.is_removed() {
            self.release_contents();
            self.table.free_map.release(sector, 1);
            log::debug!("inode {sector} released");
        }
    }
}

impl Loaded<'_> {
    pub fn read<V>(&self, f: impl FnOnce(&DiskInode) -> V) -> V {
        let record = self.inode.state.record.read();
        let Some(record) = record.as_deref() else {
            unreachable!("inode record accessed while unloaded");
        };
        f(record)
    }

    pub fn modify<V>(&self, f: impl FnOnce(&mut DiskInode) -> V) -> V {
        let mut record = self.inode.state.record.write();
        let Some(record) = record.as_deref_mut() else {
            unreachable!("inode record accessed while unloaded");
        };
        f(record)
    }
}

impl Drop for Loaded<'_> {
    fn drop(&mut self) {
        let state = &self.inode.state;
        let mut access = state.access.lock();
        *access -= 1;
        if *access == 0 {
            let record = state.record.write().take();
            if let Some(record) = record {
                record.store(&self.inode.table.cache, state.sector);
            }
        }
    }
}

impl InodeState {
    fn new(sector: SectorId) -> Self {
        Self {
            sector,
            openers: AtomicUsize::new(0),
            descriptors: AtomicUsize::new(0),
            cwd_users: AtomicUsize::new(0),
            removed: AtomicBool::new(false),
            deny_write: AtomicUsize::new(0),
            access: parking_lot::Mutex::new(0),
            record: spin::RwLock::new(None),
            growth: parking_lot::Mutex::new(()),
            mutation: parking_lot::Mutex::new(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use block_dev::MemDisk;

    use super::*;
    use crate::layout::{BLOCK_ENTRIES, MAX_SECTORS};
    use crate::Error;

    fn setup(total: usize) -> Arc<InodeTable> {
        let cache = Arc::new(SectorCache::new(Arc::new(MemDisk::new(total))));
        let free_map = Arc::new(FreeMap::format(cache.clone(), total));
        InodeTable::new(cache, free_map)
    }

    fn new_inode(table: &Arc<InodeTable>, length: usize) -> Inode {
        let sector = table.free_map().allocate(1).unwrap();
        table.create(sector, length, SectorId::new(0)).unwrap();
        table.open(sector)
    }

    #[test]
    fn write_then_read_back() {
        let table = setup(256);
        let inode = new_inode(&table, 0);
        assert_eq!(0, inode.read_at(0, &mut [0; 16]));

        let data: Vec<u8> = (0..1500).map(|i| i as u8).collect();
        assert_eq!(Ok(1500), inode.write_at(0, &data));
        assert_eq!(1500, inode.length());

        let mut buf = vec![0; 2000];
        assert_eq!(1500, inode.read_at(0, &mut buf));
        assert_eq!(data, buf[..1500]);

        // 跨扇区的中段读取
        let mut buf = [0; 100];
        assert_eq!(100, inode.read_at(480, &mut buf));
        assert_eq!(data[480..580], buf);
    }

    #[test]
    fn sparse_write_fills_gap_with_zeros() {
        let table = setup(256);
        let inode = new_inode(&table, 0);
        assert_eq!(Ok(4), inode.write_at(3 * SECTOR_SIZE, b"tail"));
        assert_eq!(3 * SECTOR_SIZE + 4, inode.length());

        let mut buf = vec![0xff; 3 * SECTOR_SIZE];
        assert_eq!(buf.len(), inode.read_at(0, &mut buf));
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn growth_is_monotonic() {
        let table = setup(512);
        let inode = new_inode(&table, 0);

        inode.grow(100, 0).unwrap();
        assert_eq!(100, inode.length());
        // 不跨扇区边界时只推进长度
        let free = table.free_map().free_count();
        inode.grow(300, 100).unwrap();
        assert_eq!(400, inode.length());
        assert_eq!(free, table.free_map().free_count());

        inode.grow(10, 0).unwrap();
        assert_eq!(400, inode.length());

        inode.grow(20 * SECTOR_SIZE, 0).unwrap();
        let length = inode.length();
        assert_eq!(20 * SECTOR_SIZE, length);
        for offset in (0..length).step_by(SECTOR_SIZE / 2) {
            assert!(inode.sector_at(offset).is_some(), "offset {offset}");
        }
        assert!(inode.sector_at(length).is_none());
    }

    #[test]
    fn allocate_mode_binds_doubly_indirect_path() {
        let table = setup(256);
        let inode = new_inode(&table, 0);
        let offset = (MAX_SECTORS - 1) * SECTOR_SIZE;
        assert!(inode.sector_at(offset).is_none());

        let free = table.free_map().free_count();
        let sector = inode.allocate_sector_at(offset).unwrap();
        // 二级索引块、一级索引块和数据扇区
        assert_eq!(free - 3, table.free_map().free_count());
        assert_eq!(Some(sector), inode.sector_at(offset));
        assert_eq!(sector, inode.allocate_sector_at(offset).unwrap());
        assert!(inode.sector_at(offset - BLOCK_ENTRIES * SECTOR_SIZE).is_none());
    }

    #[test]
    #[should_panic]
    fn resolving_past_maximum_is_fatal() {
        let table = setup(64);
        let inode = new_inode(&table, 0);
        inode.sector_at(MAX_SECTORS * SECTOR_SIZE);
    }

    #[test]
    fn open_shares_state() {
        let table = setup(64);
        let inode = new_inode(&table, 0);
        let again = table.open(inode.sector());
        assert!(Arc::ptr_eq(&inode.state, &again.state));
        assert_eq!(2, inode.openers());

        let copy = again.clone();
        assert_eq!(3, copy.openers());
        drop(again);
        drop(copy);
        assert!(table.is_open(inode.sector()));

        let sector = inode.sector();
        drop(inode);
        assert!(!table.is_open(sector));
        assert_eq!(0, table.open_count());
    }

    #[test]
    fn nested_loads_write_back_once() {
        let table = setup(64);
        let inode = new_inode(&table, 0);

        let outer = inode.load();
        outer.modify(|record| record.set_length(77));
        {
            let inner = inode.load();
            assert_eq!(77, inner.read(DiskInode::length));
        }
        assert_eq!(0, DiskInode::fetch(table.cache(), inode.sector()).length());
        drop(outer);
        assert_eq!(77, DiskInode::fetch(table.cache(), inode.sector()).length());
    }

    #[test]
    fn deny_write_blocks_writes() {
        let table = setup(64);
        let inode = new_inode(&table, 0);
        assert!(!inode.is_write_denied());
        inode.deny_write();
        inode.deny_write();
        assert!(inode.clone().is_write_denied());
        assert_eq!(Ok(0), inode.write_at(0, b"abc"));
        inode.allow_write();
        assert_eq!(Ok(0), inode.write_at(0, b"abc"));
        inode.allow_write();
        assert!(!inode.is_write_denied());
        assert_eq!(Ok(3), inode.write_at(0, b"abc"));
    }

    #[test]
    fn removal_releases_every_sector() {
        let table = setup(1024);
        let free = table.free_map().free_count();
        let inode = new_inode(&table, 0);
        // 占满直接索引并进入一级间接索引
        inode
            .write_at(0, &vec![7; (DIRECT_COUNT + 70) * SECTOR_SIZE])
            .unwrap();
        assert!(table.free_map().free_count() < free - DIRECT_COUNT - 70);

        let other = inode.clone();
        inode.remove();
        drop(inode);
        assert!(table.free_map().free_count() < free);
        drop(other);
        assert_eq!(free, table.free_map().free_count());
    }

    #[test]
    fn failed_create_returns_its_sectors() {
        let table = setup(32);
        let sector = table.free_map().allocate(1).unwrap();
        let free = table.free_map().free_count();

        assert_eq!(
            Err(Error::NoSpace),
            table.create(sector, 64 * SECTOR_SIZE, SectorId::new(0))
        );
        assert_eq!(free, table.free_map().free_count());
        assert!(table.free_map().is_allocated(sector));
    }

    #[test]
    fn initial_length_is_bound() {
        let table = setup(128);
        let inode = new_inode(&table, 3 * SECTOR_SIZE + 1);
        assert_eq!(3 * SECTOR_SIZE + 1, inode.length());
        assert!(inode.sector_at(3 * SECTOR_SIZE).is_some());
        assert_eq!(SectorId::new(0), inode.parent());
    }
}
