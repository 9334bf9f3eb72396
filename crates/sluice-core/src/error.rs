use thiserror::Error;

/// Shared lightweight error type for core primitive operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Invalid caller input or out-of-range primitive value.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Decode/parsing failure.
    #[error("decode error: {0}")]
    Decode(&'static str),
}

#[cfg(test)]
mod tests {
    use super::CoreError;

    #[test]
    fn error_messages_are_stable() {
        assert_eq!(
            CoreError::InvalidInput("am id out of range").to_string(),
            "invalid input: am id out of range"
        );
        assert_eq!(
            CoreError::Decode("short buffer").to_string(),
            "decode error: short buffer"
        );
    }
}
