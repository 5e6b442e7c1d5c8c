use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the dataset loader and the result writers.
#[derive(Error, Debug)]
pub enum OdirError {
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("Failed to read label file '{path}': {source}")]
    LabelFile {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Invalid label {value} for image '{image}' (expected 0 or 1)")]
    InvalidLabel { image: String, value: u8 },

    #[error("No usable images in split '{0}'")]
    EmptySplit(String),

    #[error("Expected {expected} rows but got {actual}")]
    RowCount { expected: usize, actual: usize },

    #[error("Expected {expected} values per row but got {actual}")]
    RowWidth { expected: usize, actual: usize },

    #[error("Not a number: '{0}'")]
    InvalidValue(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OdirError>;
