use thiserror::Error;

/// Errors returned by header and address decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer shorter than the fixed record being decoded.
    #[error("truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },
    /// Header fields that cannot appear on a valid packet.
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),
    /// Address record validation failure.
    #[error("invalid address: {0}")]
    InvalidAddress(&'static str),
}

pub(crate) fn ensure_len(what: &'static str, bytes: &[u8], need: usize) -> Result<(), CodecError> {
    if bytes.len() < need {
        return Err(CodecError::Truncated {
            what,
            need,
            have: bytes.len(),
        });
    }
    Ok(())
}
