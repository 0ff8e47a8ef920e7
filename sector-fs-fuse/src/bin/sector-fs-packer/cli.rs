use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
pub struct Cli {
    /// Directory whose files are copied into `/bin`
    #[arg(long, short)]
    pub source: PathBuf,

    /// Output directory of `fs.img`
    #[arg(long, short = 'O')]
    pub out_dir: PathBuf,

    /// Image size in MiB
    #[arg(long, default_value_t = 16)]
    pub size: u64,
}
