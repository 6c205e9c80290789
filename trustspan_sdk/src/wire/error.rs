#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum EncodeError {
    #[error("identifier too long to encode")]
    VidTooLong,
    #[error("payload section too large to encode")]
    PayloadTooLong,
    #[error("too many hops in route")]
    TooManyHops,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("envelope does not start with the expected prefix")]
    InvalidPrefix,
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown crypto type {0}")]
    UnknownCryptoType(u8),
    #[error("unknown signature type {0}")]
    UnknownSignatureType(u8),
    #[error("envelope is truncated or malformed")]
    UnexpectedData,
    #[error("envelope carries no signature")]
    MissingSignature,
    #[error("trailing data after the end of the envelope")]
    TrailingData,
    #[error("unrecognized payload tag {0}")]
    UnknownVariant(u8),
    #[error("payload tag {0} is reserved and cannot be processed")]
    Reserved(u8),
    #[error("identifier in envelope is not valid UTF-8")]
    InvalidVid,
}
