//! Crate-level errors for everything outside the compile and VM paths

use crate::parser::ErrorList;
use crate::store::StoreError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("unsupported URL scheme in {0:?}")]
    UnsupportedScheme(String),

    #[error("{path}: not a regular file, named pipe or socket")]
    UnsupportedFileType { path: String },

    #[error("invalid glob pattern {pattern:?}: {source}")]
    Glob {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error(transparent)]
    Regex(#[from] regex::Error),

    #[error("compile failed:\n{0}")]
    Compile(#[from] ErrorList),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("the tailer has shut down")]
    Shutdown,
}

impl Error {
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
