//! # 扇区缓存层
//!
//! 块设备读写速度一般慢于内存读写速度，因此我们在内存中开辟固定数量的槽位，
//! 把即将操作的扇区复制到槽位中，读写都发生在缓存副本上，脏扇区延迟写回。
//!
//! 锁的顺序总是**先表锁、后槽位锁**，持有槽位锁的线程不会再去申请表锁。
//!
//! - 读者在槽位上登记后即释放槽位锁再拷贝数据，多个读者可以并发拷贝；
//! - 写者必须等到槽位上没有读者才能修改数据。写者没有公平性保证，
//!   源源不断的读者可以让写者一直等待；
//! - 淘汰采用二次机会（时钟）策略，有读者的槽位永远不会被选为牺牲者。

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use block_dev::BlockDevice;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::config::{CACHE_CAPACITY, MAX_SKIP_SWEEPS, READ_AHEAD_CAPACITY};
use crate::{DataSector, SectorId, SECTOR_SIZE};

pub struct SectorCache {
    /// 底层块设备的引用
    device: Arc<dyn BlockDevice>,
    table: Mutex<Table>,
    entries: Box<[Entry]>,
    read_ahead: Mutex<ReadAheadQueue>,
    /// 预读任务的信号，计数即队列中待处理的扇区
    pending: Condvar,
    stopping: Mutex<bool>,
    stop_signal: Condvar,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// 表锁保护的部分：每个槽位映射的扇区，以及时钟指针
struct Table {
    tags: Box<[Option<SectorId>]>,
    hand: usize,
}

/// 缓存槽位
struct Entry {
    slot: Mutex<Slot>,
    /// 缓存的数据。写者只在持有槽位锁且没有读者时获取写锁，
    /// 所以读写锁本身从不竞争
    data: RwLock<Box<DataSector>>,
    /// 读者数归零时通知等待的写者
    idle: Condvar,
}

#[derive(Debug, Default)]
struct Slot {
    /// 对应的扇区，`None` 表示空槽位
    sector: Option<SectorId>,
    /// 是否为脏扇区
    dirty: bool,
    second_chance: bool,
    readers: usize,
}

#[derive(Debug, Default)]
struct ReadAheadQueue {
    pending: VecDeque<SectorId>,
    /// 预读任务是否在运行
    active: bool,
}

impl SectorCache {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self::with_capacity(device, CACHE_CAPACITY)
    }

    pub fn with_capacity(device: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        assert!(capacity > 0);

        Self {
            device,
            table: Mutex::new(Table {
                tags: vec![None; capacity].into(),
                hand: 0,
            }),
            entries: (0..capacity).map(|_| Entry::new()).collect(),
            read_ahead: Mutex::default(),
            pending: Condvar::new(),
            stopping: Mutex::new(false),
            stop_signal: Condvar::new(),
            tasks: Mutex::default(),
        }
    }

    /// 从扇区 `sector` 的 `offset` 处读出数据填满 `buf`
    pub fn read(&self, sector: SectorId, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= SECTOR_SIZE);

        let (entry, mut slot, miss) = self.get_and_lock(sector);
        if miss {
            self.device.read_block(sector.block(), &mut entry.data.write()[..]);
        }
        slot.second_chance = false;
        slot.readers += 1;
        drop(slot);

        buf.copy_from_slice(&entry.data.read()[offset..offset + buf.len()]);

        let mut slot = entry.slot.lock();
        slot.readers -= 1;
        if slot.readers == 0 {
            entry.idle.notify_all();
        }
    }

    /// 把 `buf` 写到扇区 `sector` 的 `offset` 处，只修改缓存副本
    pub fn write(&self, sector: SectorId, offset: usize, buf: &[u8]) {
        assert!(offset + buf.len() <= SECTOR_SIZE);

        loop {
            let (entry, mut slot, miss) = self.get_and_lock(sector);
            // 整扇区覆盖时无需先读
            if miss && (offset > 0 || buf.len() < SECTOR_SIZE) {
                self.device.read_block(sector.block(), &mut entry.data.write()[..]);
            }

            entry.idle.wait_while(&mut slot, |slot| slot.readers > 0);
            // 等待期间槽位可能被淘汰并换作它用
            if slot.sector != Some(sector) {
                continue;
            }

            entry.data.write()[offset..offset + buf.len()].copy_from_slice(buf);
            slot.second_chance = false;
            slot.dirty = true;
            return;
        }
    }

    /// 把整个扇区清零
    #[inline]
    pub fn zero(&self, sector: SectorId) {
        self.write(sector, 0, &[0; SECTOR_SIZE]);
    }

    /// 写回所有脏扇区
    pub fn flush_all(&self) {
        let _table = self.table.lock();
        for entry in self.entries.iter() {
            let mut slot = entry.slot.lock();
            entry.flush(&mut slot, &self.device);
        }
    }

    /// 丢弃扇区的缓存而不写回，用于已被释放的扇区
    pub fn invalidate(&self, sector: SectorId) {
        let mut table = self.table.lock();
        let Some(index) = table.position(sector) else {
            return;
        };

        let mut slot = self.entries[index].slot.lock();
        if slot.sector == Some(sector) {
            log::trace!("invalidate sector {sector} in slot {index}");
            *slot = Slot {
                readers: slot.readers,
                ..Slot::default()
            };
            table.tags[index] = None;
        }
    }

    /// 扇区当前是否在缓存中
    pub fn contains(&self, sector: SectorId) -> bool {
        self.table.lock().position(sector).is_some()
    }

    /// 当前缓存的所有扇区
    pub fn cached_sectors(&self) -> Vec<SectorId> {
        self.table.lock().tags.iter().flatten().copied().collect()
    }

    /// 请求预读扇区；队列已满或预读任务未运行时放弃
    pub fn request_read_ahead(&self, sector: SectorId) {
        let mut queue = self.read_ahead.lock();
        if !queue.active || queue.pending.contains(&sector) {
            return;
        }
        if queue.pending.len() == READ_AHEAD_CAPACITY {
            log::warn!("read-ahead queue is full, dropping sector {sector}");
            return;
        }

        queue.pending.push_back(sector);
        self.pending.notify_one();
    }

    /// 启动周期写回与预读两个后台任务，重复调用无效
    pub fn start_background(self: &Arc<Self>, flush_interval: Duration) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        *self.stopping.lock() = false;
        self.read_ahead.lock().active = true;

        let cache = Arc::clone(self);
        tasks.push(
            thread::Builder::new()
                .name("sector-cache-flush".into())
                .spawn(move || cache.flush_daemon(flush_interval))
                .expect("failed to spawn the flush task"),
        );

        let cache = Arc::clone(self);
        tasks.push(
            thread::Builder::new()
                .name("sector-cache-read-ahead".into())
                .spawn(move || cache.read_ahead_daemon())
                .expect("failed to spawn the read-ahead task"),
        );

        log::info!("sector cache background tasks started");
    }

    /// 通知后台任务退出并等待其结束
    pub fn stop_background(&self) {
        let tasks = mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }

        *self.stopping.lock() = true;
        self.stop_signal.notify_all();

        let mut queue = self.read_ahead.lock();
        queue.active = false;
        queue.pending.clear();
        drop(queue);
        self.pending.notify_all();

        for task in tasks {
            if task.join().is_err() {
                log::error!("sector cache background task panicked");
            }
        }
        log::info!("sector cache background tasks stopped");
    }
}

impl SectorCache {
    /// 找到并锁住映射 `sector` 的槽位，未命中时淘汰一个槽位并绑定。
    ///
    /// 第三个返回值表示是否未命中；未命中时槽位数据无效，由调用者从设备读入。
    fn get_and_lock(&self, sector: SectorId) -> (&Entry, MutexGuard<'_, Slot>, bool) {
        loop {
            let mut table = self.table.lock();

            let (entry, slot, miss) = match table.position(sector) {
                Some(index) => {
                    let entry = &self.entries[index];
                    let slot = entry.slot.lock();
                    (entry, slot, false)
                }
                None => {
                    let (index, mut slot) = self.evict(&mut table);
                    table.tags[index] = Some(sector);
                    *slot = Slot {
                        sector: Some(sector),
                        ..Slot::default()
                    };
                    (&self.entries[index], slot, true)
                }
            };
            drop(table);

            if slot.sector == Some(sector) {
                log::trace!("sector {sector}: {}", if miss { "miss" } else { "hit" });
                return (entry, slot, miss);
            }
        }
    }

    /// 二次机会淘汰：按固定的环形顺序扫描槽位，返回已锁住的牺牲者。
    ///
    /// 前 [`MAX_SKIP_SWEEPS`] 轮跳过无法立即上锁的槽位，之后改为阻塞上锁。
    fn evict(&self, table: &mut Table) -> (usize, MutexGuard<'_, Slot>) {
        let capacity = self.entries.len();
        let mut sweeps = 0;
        let mut scanned = 0;

        loop {
            let index = table.hand;
            table.hand = (table.hand + 1) % capacity;

            let entry = &self.entries[index];
            let slot = if sweeps > MAX_SKIP_SWEEPS {
                Some(entry.slot.lock())
            } else {
                entry.slot.try_lock()
            };

            if let Some(mut slot) = slot {
                if slot.readers == 0 {
                    if slot.sector.is_none() || slot.second_chance {
                        if let Some(old) = slot.sector {
                            log::debug!("evict sector {old} from slot {index}");
                        }
                        entry.flush(&mut slot, &self.device);
                        return (index, slot);
                    }
                    // 脏槽位在第一轮多留一次
                    if !slot.dirty || sweeps > 0 {
                        slot.second_chance = true;
                    }
                }
            }

            scanned += 1;
            if scanned == capacity {
                scanned = 0;
                sweeps += 1;
            }
        }
    }

    /// 不返回数据地把扇区调入缓存
    fn prefetch(&self, sector: SectorId) {
        let (entry, mut slot, miss) = self.get_and_lock(sector);
        if miss {
            self.device.read_block(sector.block(), &mut entry.data.write()[..]);
        }
        slot.second_chance = false;
    }

    fn flush_daemon(&self, interval: Duration) {
        let mut stopping = self.stopping.lock();
        loop {
            let timed_out = self.stop_signal.wait_for(&mut stopping, interval).timed_out();
            if *stopping {
                break;
            }
            if timed_out {
                MutexGuard::unlocked(&mut stopping, || self.flush_all());
            }
        }
    }

    fn read_ahead_daemon(&self) {
        loop {
            let sectors: Vec<SectorId> = {
                let mut queue = self.read_ahead.lock();
                self.pending
                    .wait_while(&mut queue, |queue| queue.active && queue.pending.is_empty());
                if !queue.active {
                    break;
                }
                queue.pending.iter().copied().collect()
            };

            for sector in sectors {
                self.prefetch(sector);
                self.read_ahead.lock().pending.retain(|&s| s != sector);
            }
        }
    }
}

impl Drop for SectorCache {
    fn drop(&mut self) {
        self.flush_all();
    }
}

impl Table {
    #[inline]
    fn position(&self, sector: SectorId) -> Option<usize> {
        self.tags.iter().position(|&tag| tag == Some(sector))
    }
}

impl Entry {
    fn new() -> Self {
        Self {
            slot: Mutex::default(),
            data: RwLock::new(Box::new([0; SECTOR_SIZE])),
            idle: Condvar::new(),
        }
    }

    /// 写回脏数据；干净的槽位不做任何事
    fn flush(&self, slot: &mut Slot, device: &Arc<dyn BlockDevice>) {
        if let (Some(sector), true) = (slot.sector, slot.dirty) {
            device.write_block(sector.block(), &self.data.read()[..]);
            slot.dirty = false;
        }
    }
}
