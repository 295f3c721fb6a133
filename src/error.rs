use thiserror::Error;

#[derive(Debug, Error)]
pub enum TapError {
    #[error("packet decode error: {0}")]
    DecodeError(String),

    #[error("no IP layer found in frame")]
    NoIpLayer,

    #[error("unsupported link type: {0}")]
    UnsupportedLinkType(u32),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("capture error: {0}")]
    CaptureError(String),

    #[error("sink error: {0}")]
    SinkError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TapError>;
