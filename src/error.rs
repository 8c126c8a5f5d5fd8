use std::path::PathBuf;

/// Errors that abort the conversion job.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse JSON file {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("incorrect COCO annotation file {}: {message}", path.display())]
    Structure { path: PathBuf, message: String },

    #[error("failed to read image size of {}: {message}", path.display())]
    ImageSize { path: PathBuf, message: String },

    #[error("failed to encode bitmap: {0}")]
    BitmapEncode(#[from] image::ImageError),
}

impl ConvertError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn structure(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Structure {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Per-record geometry decoding failures. These never abort an image.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GeometryError {
    #[error("RLE counts cover {actual} pixels but the mask has {expected}")]
    RleLength { expected: usize, actual: usize },

    #[error("invalid byte {0:#04x} in compressed RLE counts")]
    RleCharacter(u8),

    #[error("compressed RLE counts decode to a negative run")]
    RleNegativeRun,

    #[error("RLE mask of {height}x{width} pixels is too large")]
    RleTooLarge { height: usize, width: usize },

    #[error("RLE mask is {actual:?} but the image is {expected:?}")]
    RleSizeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },
}
