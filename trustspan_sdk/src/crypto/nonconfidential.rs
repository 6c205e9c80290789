//! Signed-only messages: the payload is carried in the non-confidential
//! section of the envelope, protected by an Ed25519 signature but readable by
//! anyone. Used for anycast broadcasts and for the inner introduction
//! messages of nested handshakes.

use super::CryptoError;
use crate::{
    definitions::{MessageType, PrivateVid, SealedMessage, VerifiedVid},
    wire,
};

pub(crate) fn sign(
    sender: &dyn PrivateVid,
    receiver: Option<&dyn VerifiedVid>,
    payload: &[u8],
) -> Result<SealedMessage, CryptoError> {
    let mut data = Vec::with_capacity(64);
    wire::encode_envelope(
        wire::Envelope {
            crypto_type: wire::CryptoType::Plaintext,
            signature_type: wire::SignatureType::Ed25519,
            sender: sender.identifier(),
            receiver: receiver.map(|r| r.identifier()),
            nonconfidential_data: Some(payload),
        },
        &mut data,
    )?;

    let secret_key = ed25519_dalek::SigningKey::from_bytes(sender.signing_key());
    let signature = ed25519_dalek::Signer::sign(&secret_key, &data).to_bytes();
    wire::encode_signature(&signature, &mut data);

    Ok(data)
}

pub(crate) fn verify<'a>(
    sender: &dyn VerifiedVid,
    message: &'a mut [u8],
) -> Result<(&'a [u8], MessageType), CryptoError> {
    let view = wire::decode_envelope(message)?;

    super::verify_challenge(sender, view.as_challenge())?;

    let crypto_type = view.crypto_type();
    let signature_type = view.signature_type();

    let wire::DecodedEnvelope {
        envelope,
        ciphertext: None,
    } = view.into_opened()
    else {
        return Err(CryptoError::UnexpectedRecipient);
    };

    let Some(payload) = envelope.nonconfidential_data else {
        return Err(CryptoError::MissingCiphertext);
    };

    Ok((
        payload,
        MessageType {
            crypto_type,
            signature_type,
        },
    ))
}
