//! Object storage receiving the finished dumps.

use std::io::{self, Read};
use std::path::PathBuf;

use derive_more::{Display, Error};

use crate::remote::ProcessError;

mod directory;
mod s3;

pub use directory::DirectoryStore;
pub use s3::S3CliStore;

/// Uploading an object failed.
#[derive(Debug, Display, Error)]
pub enum TransportError {
    /// The key can't be mapped onto the store.
    #[display("invalid object key '{_0}'")]
    InvalidKey(#[error(ignore)] String),
    /// Writing the object failed.
    #[display("storing {bucket}/{key} at {} failed: {source}", path.display())]
    Io {
        bucket: String,
        key: String,
        path: PathBuf,
        source: io::Error,
    },
    /// The upload client failed or couldn't be started.
    #[display("uploading {bucket}/{key} failed: {source}")]
    Command {
        bucket: String,
        key: String,
        source: ProcessError,
    },
    /// The object couldn't be streamed to the upload client.
    #[display("streaming {bucket}/{key} to the upload client failed: {source}")]
    Stream {
        bucket: String,
        key: String,
        source: io::Error,
    },
}

/// Durable storage addressed by bucket and `/` separated key.
pub trait ObjectStore {
    /// Stores everything read from `body` under `key`, replacing an existing object.
    ///
    /// Returns the number of bytes stored. Once this returns `Ok` the object is durable.
    fn upload(&self, bucket: &str, key: &str, body: &mut dyn Read) -> Result<u64, TransportError>;
}

impl<T: ObjectStore + ?Sized> ObjectStore for Box<T> {
    fn upload(&self, bucket: &str, key: &str, body: &mut dyn Read) -> Result<u64, TransportError> {
        (**self).upload(bucket, key, body)
    }
}
