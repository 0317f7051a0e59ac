use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error: {0}")]
    Stream(#[from] std::io::Error),

    #[error("record {index} is truncated")]
    Truncated { index: usize },

    #[error("record {index} has a corrupted length (crc {found:#010x}, expected {expected:#010x})")]
    LengthChecksum {
        index: usize,
        found: u32,
        expected: u32,
    },

    #[error("record {index} has corrupted data (crc {found:#010x}, expected {expected:#010x})")]
    DataChecksum {
        index: usize,
        found: u32,
        expected: u32,
    },

    #[error("malformed protobuf: {0}")]
    Proto(#[from] protobuf::Error),

    #[error("feature {0:?} is missing")]
    MissingFeature(String),

    #[error("feature {0:?} holds no value list")]
    EmptyFeature(String),

    #[error("feature {name:?} is a {found} list, expected a {expected} list")]
    FeatureKind {
        name: String,
        found: &'static str,
        expected: &'static str,
    },

    #[error("feature {feature:?} holds {actual} values, expected {expected}")]
    PixelCount {
        feature: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("label value {value} is out of range for {num_classes} classes")]
    LabelRange { value: u8, num_classes: usize },

    #[error("in record {index}: {source}")]
    InRecord {
        index: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("image geometry {height}x{width} must be a non-zero multiple of {stride}")]
    Geometry {
        height: usize,
        width: usize,
        stride: usize,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no trained model in {0:?}, run the training first")]
    MissingModel(PathBuf),

    #[error("failed to read or write a config file: {0}")]
    ConfigFile(#[from] burn::config::ConfigError),

    #[error("failed to record or restore state: {0}")]
    Recorder(#[from] burn::record::RecorderError),

    #[error("invalid arguments: {0}")]
    Args(#[from] pico_args::Error),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn in_record(self, index: usize) -> Self {
        Error::InRecord {
            index,
            source: Box::new(self),
        }
    }
}
