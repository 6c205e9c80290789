//! Sealing and opening of envelopes. The confidential suite is NaCl-style
//! authenticated encryption (X25519 + XChaCha20-Poly1305) with the sender
//! identity bound inside the ciphertext; signed-only messages carry their
//! payload in the clear, protected by an Ed25519 signature over the whole
//! envelope.

use crate::{
    definitions::{
        Digest, MessageType, NonConfidentialData, Payload, PrivateKeyData, PrivateSigningKeyData,
        PrivateVid, PublicKeyData, PublicVerificationKeyData, SealedMessage, VerifiedVid,
    },
    wire,
};

mod authcrypt;
mod digest;
pub mod error;
mod nonconfidential;

pub use digest::{blake2b256, sha256};
pub use error::CryptoError;

/// The contents of a message after opening: any non-confidential header data,
/// the decrypted payload, and the cryptographic modes that protected it.
pub type MessageContents<'a> = (
    Option<NonConfidentialData<'a>>,
    Payload<'a, &'a [u8], &'a mut [u8]>,
    wire::CryptoType,
    wire::SignatureType,
);

/// Seal a payload into an encrypted and signed envelope addressed to
/// `receiver`.
pub fn seal(
    sender: &dyn PrivateVid,
    receiver: &dyn VerifiedVid,
    nonconfidential_data: Option<NonConfidentialData>,
    payload: Payload<&[u8]>,
) -> Result<SealedMessage, CryptoError> {
    authcrypt::seal(sender, receiver, nonconfidential_data, payload, None)
}

/// As [`seal`], but also reports the digest of the plaintext control payload,
/// which callers use as the thread id of a relationship handshake.
pub fn seal_and_hash(
    sender: &dyn PrivateVid,
    receiver: &dyn VerifiedVid,
    nonconfidential_data: Option<NonConfidentialData>,
    payload: Payload<&[u8]>,
    digest: &mut Digest,
) -> Result<SealedMessage, CryptoError> {
    authcrypt::seal(sender, receiver, nonconfidential_data, payload, Some(digest))
}

/// Verify the outer signature of a sealed message and decrypt it in place.
/// The returned payload borrows from the (now decrypted) message buffer.
pub fn open<'a>(
    receiver: &dyn PrivateVid,
    sender: &dyn VerifiedVid,
    message: &'a mut [u8],
) -> Result<(Digest, MessageContents<'a>), CryptoError> {
    let view = wire::decode_envelope(message)?;

    verify_challenge(sender, view.as_challenge())?;

    let crypto_type = view.crypto_type();
    let signature_type = view.signature_type();

    let wire::DecodedEnvelope {
        envelope,
        ciphertext: Some(ciphertext),
    } = view.into_opened()
    else {
        return Err(CryptoError::MissingCiphertext);
    };

    if envelope.receiver != Some(receiver.identifier().as_bytes()) {
        return Err(CryptoError::UnexpectedRecipient);
    }

    authcrypt::open(
        receiver,
        sender,
        envelope.nonconfidential_data,
        ciphertext,
        crypto_type,
        signature_type,
    )
}

/// Produce a signed-but-unencrypted message; the payload travels in the
/// non-confidential section of the envelope.
pub fn sign(
    sender: &dyn PrivateVid,
    receiver: Option<&dyn VerifiedVid>,
    payload: &[u8],
) -> Result<SealedMessage, CryptoError> {
    nonconfidential::sign(sender, receiver, payload)
}

/// Verify the signature on a signed-only message and hand out its payload.
pub fn verify<'a>(
    sender: &dyn VerifiedVid,
    message: &'a mut [u8],
) -> Result<(&'a [u8], MessageType), CryptoError> {
    nonconfidential::verify(sender, message)
}

fn verify_challenge(
    sender: &dyn VerifiedVid,
    challenge: wire::VerificationChallenge,
) -> Result<(), CryptoError> {
    let verify_error =
        |err| CryptoError::SignatureInvalid(sender.identifier().to_string(), err);

    let signature =
        ed25519_dalek::Signature::from_slice(challenge.signature).map_err(verify_error)?;
    let verifying_key =
        ed25519_dalek::VerifyingKey::from_bytes(sender.verifying_key()).map_err(verify_error)?;

    verifying_key
        .verify_strict(challenge.signed_data, &signature)
        .map_err(verify_error)
}

/// Generate a new X25519 encryption key pair.
pub fn gen_encrypt_keypair() -> (PrivateKeyData, PublicKeyData) {
    let secret_key = crypto_box::SecretKey::generate(&mut rand::rngs::OsRng);
    let public_key = secret_key.public_key();

    (secret_key.to_bytes().into(), public_key.to_bytes().into())
}

/// Generate a new Ed25519 signing key pair.
pub fn gen_sign_keypair() -> (PrivateSigningKeyData, PublicVerificationKeyData) {
    let signing_key = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);

    (
        signing_key.to_bytes().into(),
        signing_key.verifying_key().to_bytes().into(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vid::OwnedVid;
    use url::Url;

    fn test_vid(id: &str) -> OwnedVid {
        OwnedVid::bind(id, Url::parse("https://example.com/endpoint").unwrap())
    }

    #[test]
    fn seal_open_message() {
        let alice = test_vid("did:test:alice");
        let bob = test_vid("did:test:bob");

        let secret_message: &[u8] = b"hello world";
        let nonconfidential_data: &[u8] = b"extra header data";

        let mut message = seal(
            &alice,
            &bob,
            Some(nonconfidential_data),
            Payload::Content(secret_message),
        )
        .unwrap();

        let (_, (received_nonconfidential_data, received_payload, crypto_type, signature_type)) =
            open(&bob, &alice, &mut message).unwrap();

        assert_eq!(received_nonconfidential_data.unwrap(), nonconfidential_data);
        assert_eq!(received_payload.as_bytes(), secret_message);
        assert_eq!(crypto_type, wire::CryptoType::Authcrypt);
        assert_eq!(signature_type, wire::SignatureType::Ed25519);
    }

    #[test]
    fn thread_id_covers_the_plaintext() {
        let alice = test_vid("did:test:alice");
        let bob = test_vid("did:test:bob");

        let mut thread_id = Digest::default();
        let mut message = seal_and_hash(
            &alice,
            &bob,
            None,
            Payload::RequestRelationship {
                route: None,
                thread_id: Default::default(),
            },
            &mut thread_id,
        )
        .unwrap();

        assert_ne!(thread_id, Digest::default());

        let (opened_thread_id, (_, payload, _, _)) = open(&bob, &alice, &mut message).unwrap();
        assert_eq!(opened_thread_id, thread_id);
        assert!(matches!(payload, Payload::RequestRelationship { .. }));
    }

    #[test]
    fn two_requests_never_share_a_thread_id() {
        let alice = test_vid("did:test:alice");
        let bob = test_vid("did:test:bob");

        let request = Payload::RequestRelationship {
            route: None,
            thread_id: Default::default(),
        };

        let mut first = Digest::default();
        let mut second = Digest::default();
        seal_and_hash(&alice, &bob, None, request, &mut first).unwrap();
        let request = Payload::RequestRelationship {
            route: None,
            thread_id: Default::default(),
        };
        seal_and_hash(&alice, &bob, None, request, &mut second).unwrap();

        assert_ne!(first, second);
    }

    #[test]
    fn tampering_breaks_the_signature() {
        let alice = test_vid("did:test:alice");
        let bob = test_vid("did:test:bob");

        let mut message = seal(&alice, &bob, None, Payload::Content(b"payload")).unwrap();
        let tamper_at = message.len() / 2;
        message[tamper_at] ^= 0x40;

        let result = open(&bob, &alice, &mut message);
        assert!(matches!(
            result,
            Err(CryptoError::SignatureInvalid(..)) | Err(CryptoError::Decode(_))
        ));
    }

    #[test]
    fn wrong_receiver_is_rejected() {
        let alice = test_vid("did:test:alice");
        let bob = test_vid("did:test:bob");
        let charlie = test_vid("did:test:charlie");

        let mut message = seal(&alice, &bob, None, Payload::Content(b"for bob")).unwrap();

        let result = open(&charlie, &alice, &mut message);
        assert!(matches!(result, Err(CryptoError::UnexpectedRecipient)));
    }

    #[test]
    fn impersonation_is_detected() {
        let alice = test_vid("did:test:alice");
        let bob = test_vid("did:test:bob");
        let mallory = test_vid("did:test:mallory");

        let mut message = seal(&alice, &bob, None, Payload::Content(b"hi")).unwrap();

        // claiming the message came from mallory fails signature verification
        let result = open(&bob, &mallory, &mut message);
        assert!(matches!(result, Err(CryptoError::SignatureInvalid(..))));
    }

    #[test]
    fn sign_verify_roundtrip() {
        let alice = test_vid("did:test:alice");
        let bob = test_vid("did:test:bob");

        let mut message = sign(&alice, Some(&bob), b"public announcement").unwrap();
        let (payload, message_type) = verify(&alice, &mut message).unwrap();

        assert_eq!(payload, b"public announcement");
        assert_eq!(message_type.crypto_type, wire::CryptoType::Plaintext);
        assert_eq!(message_type.signature_type, wire::SignatureType::Ed25519);
    }
}
