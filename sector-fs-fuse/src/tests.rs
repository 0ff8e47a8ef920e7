use std::sync::Arc;

use block_dev::{BlockDevice, BLOCK_SIZE};
use sector_fs::{FileSystem, MountOptions};

use crate::BlockFile;

fn image(blocks: usize) -> BlockFile {
    let fd = tempfile::tempfile().unwrap();
    fd.set_len((blocks * BLOCK_SIZE) as u64).unwrap();
    BlockFile::new(fd).unwrap()
}

#[test]
fn block_file_round_trips_blocks() {
    let file = image(8);
    assert_eq!(8, file.block_count());

    file.write_block(5, &[0x5a; BLOCK_SIZE]);
    let mut buf = [0; BLOCK_SIZE];
    file.read_block(5, &mut buf);
    assert_eq!([0x5a; BLOCK_SIZE], buf);
    file.read_block(4, &mut buf);
    assert_eq!([0; BLOCK_SIZE], buf);
}

#[test]
fn misaligned_image_is_rejected() {
    let fd = tempfile::tempfile().unwrap();
    fd.set_len((BLOCK_SIZE + 1) as u64).unwrap();
    let err = BlockFile::new(fd).unwrap_err();
    assert_eq!(std::io::ErrorKind::InvalidInput, err.kind());

    let fd = tempfile::tempfile().unwrap();
    assert_eq!(0, BlockFile::new(fd).unwrap().block_count());
}

#[test]
#[should_panic(expected = "out of the image")]
fn access_past_the_image_is_fatal() {
    image(2).read_block(2, &mut [0; BLOCK_SIZE]);
}

#[test]
fn image_survives_remount() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fs.img");
    let fd = std::fs::File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .unwrap();
    fd.set_len((1024 * BLOCK_SIZE) as u64).unwrap();

    let payload: Vec<u8> = (0..5000).map(|i| (i % 97) as u8).collect();
    {
        let device: Arc<dyn BlockDevice> = Arc::new(BlockFile::new(fd).unwrap());
        let options = MountOptions {
            format: true,
            background: false,
            ..Default::default()
        };
        let fs = FileSystem::init(device, options).unwrap();
        let root = fs.root();
        fs.create_dir("/bin", &root).unwrap();
        fs.create("/bin/app", 0, &root).unwrap();
        let app = fs.open("/bin/app", &root).unwrap();
        assert_eq!(Ok(payload.len()), app.write_at(0, &payload));
    }

    let fd = std::fs::File::options()
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();
    let device: Arc<dyn BlockDevice> = Arc::new(BlockFile::new(fd).unwrap());
    let options = MountOptions {
        background: false,
        ..Default::default()
    };
    let fs = FileSystem::init(device, options).unwrap();
    let app = fs.open("/bin/app", &fs.root()).unwrap();
    let mut buf = vec![0; payload.len()];
    assert_eq!(payload.len(), app.read_at(0, &mut buf));
    assert_eq!(payload, buf);
}
