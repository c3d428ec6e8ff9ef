#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("needed {needed} bytes but only {remaining} remain")]
    Truncated { needed: usize, remaining: usize },
    #[error("string is not null-terminated within the buffer")]
    Unterminated,
    #[error("string is not valid utf-8")]
    InvalidUtf8,
    #[error("string contains an interior null byte")]
    InteriorNul,
    #[error("write of {needed} bytes exceeds capacity ({remaining} left)")]
    Overflow { needed: usize, remaining: usize },
    #[error("position {position} is past the end of a {len}-byte buffer")]
    InvalidPosition { position: usize, len: usize },
}
