mod cli;

use std::fs::{self, OpenOptions};
use std::io;
use std::sync::Arc;

use block_dev::BlockDevice;
use clap::Parser;
use cli::Cli;
use sector_fs::{FileSystem, MountOptions};
use sector_fs_fuse::BlockFile;
use typed_bytesize::ByteSizeIec;

fn main() -> io::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    println!("source={:?}\nout_dir={:?}", cli.source, cli.out_dir);

    let disk_size = ByteSizeIec::mib(cli.size).0;
    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(cli.out_dir.join("fs.img"))?;
    fd.set_len(disk_size)?;

    let block_dev: Arc<dyn BlockDevice> = Arc::new(BlockFile::new(fd)?);
    let options = MountOptions {
        format: true,
        background: false,
        ..Default::default()
    };
    let fs = FileSystem::init(block_dev, options).map_err(io::Error::other)?;
    let root = fs.root();
    fs.create_dir("/bin", &root).map_err(io::Error::other)?;

    for app in fs::read_dir(&cli.source)? {
        let app = app?;
        if !app.file_type()?.is_file() {
            continue;
        }
        let name = app.file_name().to_string_lossy().into_owned();
        let data = fs::read(app.path())?;
        log::info!("app={name:?}, {} bytes", data.len());

        let path = format!("/bin/{name}");
        fs.create(&path, 0, &root).map_err(io::Error::other)?;
        let file = fs.open(&path, &root).map_err(io::Error::other)?;
        file.write_at(0, &data).map_err(io::Error::other)?;
    }

    fs.shutdown();
    Ok(())
}
