//! Error types for the letter classifier

use thiserror::Error;

/// Failures while decoding, pairing or splitting the dataset.
/// Every variant is fatal for the run.
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("{source_name}: malformed header, needed {expected} bytes but only {actual} were available")]
    MalformedHeader {
        source_name: String,
        expected: usize,
        actual: usize,
    },

    #[error("{source_name}: payload holds {actual} bytes but the header declares {expected}")]
    TruncatedData {
        source_name: String,
        expected: usize,
        actual: usize,
    },

    #[error("{source_name}: label {value} at index {index} goes below zero when shifted by {offset}")]
    OutOfRangeLabel {
        source_name: String,
        index: usize,
        value: u8,
        offset: u8,
    },

    #[error("{source_name}: label {value} at index {index} is past the {num_classes} classes once shifted by {offset}")]
    LabelOutOfAlphabet {
        source_name: String,
        index: usize,
        value: u8,
        offset: u8,
        num_classes: usize,
    },

    #[error("class {class} has {count} records, stratified splitting needs at least {required}")]
    ClassImbalance {
        class: u8,
        count: usize,
        required: usize,
    },

    #[error("{source_name}: {labels} labels do not match {images} images")]
    LengthMismatch {
        source_name: String,
        images: usize,
        labels: usize,
    },

    #[error("invalid split fraction {0}")]
    InvalidFraction(f64),

    #[error("{source_name}: {error}")]
    Io {
        source_name: String,
        #[source]
        error: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] json::Error),

    #[error("Invalid model file: {0}")]
    ModelFormat(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

pub type Result<T> = std::result::Result<T, Error>;
