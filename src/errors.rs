use thiserror::Error;

#[derive(Error, Debug)]
pub enum GruError {
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error(
        "SKIP input mode requires the input width ({input_width}) to equal the hidden size ({hidden_size})"
    )]
    SkipInputWidth {
        input_width: usize,
        hidden_size: usize,
    },

    #[error("Invalid batch profile: {message}")]
    InvalidProfile { message: String },

    #[error("Buffer `{name}` holds {actual} elements, expected {expected}")]
    BufferSize {
        name: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Strided view needs {required} elements but the buffer holds {available}")]
    ViewOutOfBounds { required: usize, available: usize },

    #[error("Shape mismatch in {op}: {message}")]
    ShapeMismatch { op: &'static str, message: String },

    #[error("Verification failed: {message}")]
    Verification { message: String },
}

impl GruError {
    /// Checks that a caller-supplied buffer has exactly the length the layout expects.
    pub fn check_len(name: &'static str, expected: usize, actual: usize) -> Result<()> {
        if expected != actual {
            return Err(GruError::BufferSize {
                name,
                expected,
                actual,
            });
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, GruError>;
