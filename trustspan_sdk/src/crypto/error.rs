use crate::wire;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("failed to encode message {0}")]
    Encode(#[from] wire::EncodeError),
    #[error("failed to decode message {0}")]
    Decode(#[from] wire::DecodeError),
    #[error("encryption or decryption failed: {0}")]
    DecryptionFailed(#[from] crypto_box::aead::Error),
    #[error("could not verify signature of message from {0}: {1}")]
    SignatureInvalid(String, #[source] ed25519_dalek::ed25519::Error),
    #[error("message is not addressed to us")]
    UnexpectedRecipient,
    #[error("encrypted message without a ciphertext section")]
    MissingCiphertext,
    #[error("the sender identity inside the ciphertext does not match the envelope")]
    UnexpectedSender,
    #[error("no sender identity found inside the ciphertext")]
    MissingSender,
}
