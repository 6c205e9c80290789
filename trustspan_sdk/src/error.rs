use bytes::BytesMut;

use crate::{crypto::CryptoError, relationship::RelationshipError, vid::VidError, wire};

/// The combined error type for all store operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("encoding error: {0}")]
    Encode(#[from] wire::EncodeError),
    #[error("decoding error: {0}")]
    Decode(#[from] wire::DecodeError),
    #[error("cryptographic error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("identifier error: {0}")]
    Vid(#[from] VidError),
    #[error("relationship error: {0}")]
    Relationship(String),
    #[error("invalid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("invalid UTF-8: {0}")]
    FromUtf8(#[from] std::string::FromUtf8Error),
    #[error("'{0}' is not a verified recipient")]
    UnknownRecipient(String),
    #[error("'{0}' was not found in the store")]
    NotFound(String),
    #[error("'{0}' already exists in the store")]
    DuplicateIdentifier(String),
    #[error("invalid route: {0}")]
    MalformedRoute(String),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("no private VID found for '{0}'")]
    MissingPrivateVid(String),
    #[error("'{0}' is not verified; call verify_vid first")]
    UnverifiedVid(String),
    #[error("message from unverified source '{0}'")]
    UnverifiedSource(String, Option<BytesMut>),
    #[cfg(feature = "async")]
    #[error("wallet error: {0}")]
    Wallet(#[from] aries_askar::Error),
    #[error("could not decode stored state: {0}")]
    DecodeState(&'static str),
    #[error("internal error")]
    Internal,
}

impl From<RelationshipError> for Error {
    fn from(err: RelationshipError) -> Error {
        Error::Relationship(err.to_string())
    }
}

// a poisoned lock means another thread panicked mid-operation
impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Error {
        Error::Internal
    }
}
