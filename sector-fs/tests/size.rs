use std::mem;

use sector_fs::layout::{DirEntry, DiskInode, MAX_SECTORS};
use sector_fs::SECTOR_SIZE;

#[test]
fn on_disk_records() {
    assert_eq!(SECTOR_SIZE, mem::size_of::<DiskInode>());
    assert_eq!(32, mem::size_of::<DirEntry>());
    assert_eq!(16459, MAX_SECTORS);
}
