use thiserror::Error;

/// Error taxonomy for the jail.
///
/// Config and Net errors surface before or around a spawn attempt in the
/// supervisor; the remaining kinds are raised inside the cloned child, where
/// any of them terminates the child with status 1.
#[derive(Error, Debug)]
pub enum JailError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("network error: {0}")]
    Net(String),

    #[error("mount error: {0}")]
    Mount(String),

    #[error("privilege error: {0}")]
    Privilege(String),

    #[error("resource limit error: {0}")]
    ResourceLimit(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),
}

impl From<nix::errno::Errno> for JailError {
    fn from(err: nix::errno::Errno) -> Self {
        JailError::Process(err.to_string())
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, JailError>;
