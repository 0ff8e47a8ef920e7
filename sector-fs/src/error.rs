use derive_more::Display;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[display(fmt = "no free sector left on device")]
    NoSpace,
    #[display(fmt = "no such file or directory")]
    NotFound,
    #[display(fmt = "entry already exists")]
    AlreadyExists,
    #[display(fmt = "invalid entry name")]
    InvalidName,
    #[display(fmt = "not a directory")]
    NotADirectory,
    #[display(fmt = "is a directory")]
    IsADirectory,
    #[display(fmt = "directory not empty")]
    DirectoryNotEmpty,
    #[display(fmt = "directory is in use")]
    Busy,
}

impl std::error::Error for Error {}
