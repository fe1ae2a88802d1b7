use thiserror::Error;

/// Failures reported by the card transport (reader hardware abstraction).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no card in the reader field")]
    NoCard,
    #[error("card was removed during the session")]
    CardRemoved,
    #[error("APDU exchange timed out")]
    Timeout,
    #[error("reader communication failed: {0}")]
    Communication(String),
}

/// Reasons a protocol walk is abandoned before reaching a terminal phase.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalkAbort {
    #[error("card removed mid-session")]
    CardRemoved,
    #[error("{0} consecutive APDU exchanges timed out")]
    TooManyTimeouts(u32),
    #[error("reader communication failed: {0}")]
    Communication(String),
}

/// Why a BER-TLV decode stopped early.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TlvError {
    #[error("tag truncated at offset {0}")]
    TruncatedTag(usize),
    #[error("tag longer than 4 bytes at offset {0}")]
    TagTooLong(usize),
    #[error("length field truncated at offset {0}")]
    TruncatedLength(usize),
    #[error("unsupported length encoding {0:#04X}")]
    UnsupportedLength(u8),
    #[error("value of tag {tag} declares {declared} bytes, {available} available")]
    TruncatedValue {
        tag: String,
        declared: usize,
        available: usize,
    },
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("invalid settings: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
