//! # 空闲扇区位图
//!
//! 位图覆盖设备上的所有扇区，存放在根目录索引节点之后的连续扇区中。
//! 内存中保留一份副本，每次修改都通过扇区缓存写回对应的字。
//! 写回可能因淘汰而阻塞在设备上，所以位图锁是可睡眠的互斥锁。

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{FREE_MAP_START, ROOT_DIR_SECTOR};
use crate::{Error, Result, SectorCache, SectorId, SECTOR_BITS, SECTOR_SIZE};

/// 每个位图扇区包含的字数
const WORDS_PER_SECTOR: usize = SECTOR_SIZE / 8;

pub struct FreeMap {
    cache: Arc<SectorCache>,
    words: Mutex<Vec<u64>>,
    /// 位图所指示的总扇区数
    total: usize,
}

impl FreeMap {
    /// 覆盖 `total` 个扇区的位图所占的扇区数
    #[inline]
    pub fn sectors_for(total: usize) -> usize {
        total.div_ceil(SECTOR_BITS)
    }

    /// 建立全新的位图，根目录与位图自身所在的扇区标记为已用
    pub fn format(cache: Arc<SectorCache>, total: usize) -> Self {
        let reserved = FREE_MAP_START.block() + Self::sectors_for(total);
        assert!(
            reserved < total,
            "device with {total} sectors is too small to hold a file system"
        );
        debug_assert!(ROOT_DIR_SECTOR.block() < reserved);

        let map = Self {
            cache,
            words: Mutex::new(vec![0; Self::sectors_for(total) * WORDS_PER_SECTOR]),
            total,
        };

        let mut words = map.words.lock();
        for index in 0..reserved {
            let (word, bit) = locate(index);
            words[word] |= 1 << bit;
        }
        map.persist(&words, 0..words.len());
        drop(words);

        map
    }

    /// 从设备上读出已有的位图
    pub fn open(cache: Arc<SectorCache>, total: usize) -> Self {
        let mut words = vec![0; Self::sectors_for(total) * WORDS_PER_SECTOR];
        for (index, word) in words.iter_mut().enumerate() {
            let mut bytes = [0; 8];
            cache.read(Self::sector_of(index), index % WORDS_PER_SECTOR * 8, &mut bytes);
            *word = u64::from_ne_bytes(bytes);
        }

        Self {
            cache,
            words: Mutex::new(words),
            total,
        }
    }

    /// 分配 `count` 个连续的空闲扇区，返回第一个扇区
    pub fn allocate(&self, count: usize) -> Result<SectorId> {
        assert!(count > 0);
        let mut words = self.words.lock();

        let mut run = 0;
        for index in 0..self.total {
            let (word, bit) = locate(index);
            if words[word] & (1 << bit) != 0 {
                run = 0;
                continue;
            }

            run += 1;
            if run == count {
                let start = index + 1 - count;
                for index in start..=index {
                    let (word, bit) = locate(index);
                    words[word] |= 1 << bit;
                }
                self.persist(&words, locate(start).0..locate(index).0 + 1);
                return Ok(SectorId::new(start as u32));
            }
        }

        log::debug!("free map exhausted, cannot allocate {count} sectors");
        Err(Error::NoSpace)
    }

    /// 归还从 `sector` 开始的 `count` 个扇区，并丢弃它们的缓存
    pub fn release(&self, sector: SectorId, count: usize) {
        let start = sector.block();
        let mut words = self.words.lock();
        for index in start..start + count {
            let (word, bit) = locate(index);
            // 编号一定得有对应的位
            assert_ne!(words[word] & (1 << bit), 0, "double release of sector {index}");
            words[word] &= !(1 << bit);
        }
        if count > 0 {
            self.persist(&words, locate(start).0..locate(start + count - 1).0 + 1);
        }
        drop(words);

        for offset in 0..count {
            self.cache.invalidate(sector + offset as u32);
        }
    }

    #[inline]
    pub fn is_allocated(&self, sector: SectorId) -> bool {
        let (word, bit) = locate(sector.block());
        self.words.lock()[word] & (1 << bit) != 0
    }

    /// 剩余的空闲扇区数
    pub fn free_count(&self) -> usize {
        let words = self.words.lock();
        (0..self.total)
            .filter(|&index| {
                let (word, bit) = locate(index);
                words[word] & (1 << bit) == 0
            })
            .count()
    }
}

impl FreeMap {
    #[inline]
    fn sector_of(word: usize) -> SectorId {
        FREE_MAP_START + (word / WORDS_PER_SECTOR) as u32
    }

    /// 把区间内的字写回缓存
    fn persist(&self, words: &[u64], range: core::ops::Range<usize>) {
        for index in range {
            self.cache.write(
                Self::sector_of(index),
                index % WORDS_PER_SECTOR * 8,
                &words[index].to_ne_bytes(),
            );
        }
    }
}

/// 扇区编号 -> (字索引, 字内位)
#[inline]
fn locate(index: usize) -> (usize, usize) {
    (index / 64, index % 64)
}

#[cfg(test)]
mod tests {
    use block_dev::MemDisk;

    use super::*;

    fn setup(total: usize) -> (Arc<SectorCache>, FreeMap) {
        let cache = Arc::new(SectorCache::new(Arc::new(MemDisk::new(total))));
        let map = FreeMap::format(cache.clone(), total);
        (cache, map)
    }

    #[test]
    fn format_reserves_root_and_bitmap() {
        let (_cache, map) = setup(128);
        assert!(map.is_allocated(ROOT_DIR_SECTOR));
        assert!(map.is_allocated(FREE_MAP_START));
        assert_eq!(126, map.free_count());
        assert_eq!(SectorId::new(2), map.allocate(1).unwrap());
    }

    #[test]
    fn released_sectors_are_reused() {
        let (_cache, map) = setup(128);
        let a = map.allocate(1).unwrap();
        let b = map.allocate(1).unwrap();
        map.release(a, 1);

        assert_eq!(a, map.allocate(1).unwrap());
        assert!(map.is_allocated(b));
    }

    #[test]
    fn contiguous_runs_skip_holes() {
        let (_cache, map) = setup(128);
        let a = map.allocate(1).unwrap();
        let _b = map.allocate(1).unwrap();
        map.release(a, 1);

        let run = map.allocate(3).unwrap();
        assert_eq!(a + 2, run);
    }

    #[test]
    fn exhaustion_is_reported() {
        let (_cache, map) = setup(8);
        for _ in 0..6 {
            map.allocate(1).unwrap();
        }
        assert_eq!(Err(Error::NoSpace), map.allocate(1));
        assert_eq!(0, map.free_count());
    }

    #[test]
    fn bitmap_survives_reopen() {
        let (cache, map) = setup(5000);
        assert_eq!(2, FreeMap::sectors_for(5000));
        let sector = map.allocate(4).unwrap();
        drop(map);

        let map = FreeMap::open(cache, 5000);
        assert!(map.is_allocated(sector + 3));
        assert!(!map.is_allocated(sector + 4));
        assert_eq!(5000 - 3 - 4, map.free_count());
    }

    #[test]
    fn allocation_under_cache_pressure() {
        use std::collections::BTreeSet;
        use std::sync::Barrier;
        use std::thread;

        const THREADS: usize = 6;
        const PER_THREAD: usize = 40;

        // 两个槽位装不下位图和数据，写回位图时会淘汰脏扇区
        let cache = Arc::new(SectorCache::with_capacity(
            Arc::new(MemDisk::new(5000)),
            2,
        ));
        let map = Arc::new(FreeMap::format(cache.clone(), 5000));
        let free = map.free_count();
        let barrier = Arc::new(Barrier::new(THREADS));

        let workers: Vec<_> = (0..THREADS)
            .map(|t| {
                let cache = cache.clone();
                let map = map.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let mut kept = Vec::new();
                    for i in 0..PER_THREAD {
                        let sector = map.allocate(1).unwrap();
                        cache.write(sector, 0, &[t as u8; 16]);
                        if i % 2 == 0 {
                            map.release(sector, 1);
                        } else {
                            kept.push(sector);
                        }
                    }
                    kept
                })
            })
            .collect();

        let kept: Vec<SectorId> = workers
            .into_iter()
            .flat_map(|worker| worker.join().unwrap())
            .collect();
        let distinct: BTreeSet<_> = kept.iter().copied().collect();
        assert_eq!(kept.len(), distinct.len());
        assert!(kept.iter().all(|&sector| map.is_allocated(sector)));
        assert_eq!(free - kept.len(), map.free_count());

        for &sector in &kept {
            map.release(sector, 1);
        }
        assert_eq!(free, map.free_count());

        // 写回的位图与内存副本一致
        cache.flush_all();
        drop(map);
        let map = FreeMap::open(cache, 5000);
        assert_eq!(free, map.free_count());
    }
}
