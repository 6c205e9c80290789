//! The confidential suite: X25519 key agreement with XChaCha20-Poly1305
//! (crypto_box's `ChaChaBox`). The plaintext embeds the sender identity, so a
//! decrypted payload cannot be re-attributed to a different signer than the
//! envelope claims.

use crypto_box::{
    ChaChaBox, PublicKey, SecretKey,
    aead::{AeadCore, AeadInPlace, OsRng},
};
use rand::{SeedableRng, rngs::StdRng};
use rand_core::RngCore;

use super::{CryptoError, MessageContents, blake2b256};
use crate::{
    definitions::{Digest, NonConfidentialData, Payload, PrivateVid, SealedMessage, VerifiedVid},
    wire,
};

/// Lengths of the Poly1305 tag and XChaCha20 nonce appended to the ciphertext.
const TAG_LENGTH: usize = 16;
const CRYPT_NONCE_LENGTH: usize = 24;

pub(crate) fn seal(
    sender: &dyn PrivateVid,
    receiver: &dyn VerifiedVid,
    nonconfidential_data: Option<NonConfidentialData>,
    payload: Payload<&[u8]>,
    digest: Option<&mut Digest>,
) -> Result<SealedMessage, CryptoError> {
    let mut csprng = StdRng::from_entropy();

    let mut data = Vec::with_capacity(64);
    wire::encode_envelope(
        wire::Envelope {
            crypto_type: wire::CryptoType::Authcrypt,
            signature_type: wire::SignatureType::Ed25519,
            sender: sender.identifier(),
            receiver: Some(receiver.identifier()),
            nonconfidential_data,
        },
        &mut data,
    )?;

    let mut fresh_nonce = || wire::Nonce::generate(|dst| csprng.fill_bytes(dst));

    let payload = match payload {
        Payload::Content(data) => wire::Payload::GenericMessage(data),
        Payload::NestedMessage(data) => wire::Payload::NestedMessage(data),
        Payload::RoutedMessage(hops, data) => wire::Payload::RoutedMessage(hops, data),
        Payload::RequestRelationship { route, .. } => wire::Payload::DirectRelationProposal {
            nonce: fresh_nonce(),
            hops: route.unwrap_or_default(),
        },
        Payload::AcceptRelationship { thread_id } => {
            wire::Payload::DirectRelationAffirm { reply: thread_id }
        }
        Payload::CancelRelationship { thread_id } => {
            wire::Payload::RelationshipCancel { reply: thread_id }
        }
        Payload::RequestNestedRelationship { inner, .. } => wire::Payload::NestedRelationProposal {
            nonce: fresh_nonce(),
            message: inner,
        },
        Payload::AcceptNestedRelationship { inner, thread_id } => {
            wire::Payload::NestedRelationAffirm {
                reply: thread_id,
                message: inner,
            }
        }
    };

    let mut plaintext = Vec::with_capacity(64);
    wire::encode_payload(&payload, Some(sender.identifier().as_bytes()), &mut plaintext)?;

    // the thread id is the digest of the plaintext, established before
    // encryption so both ends derive the same value
    if let Some(digest) = digest {
        *digest = blake2b256(&plaintext);
    }

    let secret_key = SecretKey::from(**sender.decryption_key());
    let public_key = PublicKey::from(**receiver.encryption_key());
    let sender_box = ChaChaBox::new(&public_key, &secret_key);

    let nonce = ChaChaBox::generate_nonce(&mut OsRng);
    let tag = sender_box.encrypt_in_place_detached(&nonce, &[], &mut plaintext)?;
    plaintext.extend_from_slice(&tag);
    plaintext.extend_from_slice(&nonce);

    wire::encode_ciphertext(&plaintext, &mut data)?;

    let secret_key = ed25519_dalek::SigningKey::from_bytes(sender.signing_key());
    let signature = ed25519_dalek::Signer::sign(&secret_key, &data).to_bytes();
    wire::encode_signature(&signature, &mut data);

    Ok(data)
}

pub(crate) fn open<'a>(
    receiver: &dyn PrivateVid,
    sender: &dyn VerifiedVid,
    nonconfidential_data: Option<&'a [u8]>,
    ciphertext: &'a mut [u8],
    crypto_type: wire::CryptoType,
    signature_type: wire::SignatureType,
) -> Result<(Digest, MessageContents<'a>), CryptoError> {
    if ciphertext.len() < TAG_LENGTH + CRYPT_NONCE_LENGTH {
        return Err(wire::DecodeError::UnexpectedData.into());
    }

    let (ciphertext, footer) = ciphertext.split_at_mut(
        ciphertext.len() - TAG_LENGTH - CRYPT_NONCE_LENGTH,
    );
    let (tag, nonce) = footer.split_at(TAG_LENGTH);

    let secret_key = SecretKey::from(**receiver.decryption_key());
    let public_key = PublicKey::from(**sender.encryption_key());
    let receiver_box = ChaChaBox::new(&public_key, &secret_key);

    receiver_box.decrypt_in_place_detached(nonce.into(), &[], ciphertext, tag.into())?;

    // the digest covers the full plaintext, including the embedded sender
    // identity and the payload tag
    let thread_id = blake2b256(ciphertext);

    let wire::DecodedPayload {
        payload,
        sender_identity,
    } = wire::decode_payload(ciphertext)?;

    match sender_identity {
        Some(identity) if identity == sender.identifier().as_bytes() => {}
        Some(_) => return Err(CryptoError::UnexpectedSender),
        None => return Err(CryptoError::MissingSender),
    }

    let payload = match payload {
        wire::Payload::GenericMessage(data) => Payload::Content(data as _),
        wire::Payload::NestedMessage(data) => Payload::NestedMessage(data),
        wire::Payload::RoutedMessage(hops, data) => Payload::RoutedMessage(hops, data as _),
        wire::Payload::DirectRelationProposal { hops, .. } => Payload::RequestRelationship {
            route: if hops.is_empty() { None } else { Some(hops) },
            thread_id,
        },
        wire::Payload::DirectRelationAffirm { reply } => {
            Payload::AcceptRelationship { thread_id: reply }
        }
        wire::Payload::RelationshipCancel { reply } => {
            Payload::CancelRelationship { thread_id: reply }
        }
        wire::Payload::NestedRelationProposal { message, .. } => {
            Payload::RequestNestedRelationship {
                inner: message,
                thread_id,
            }
        }
        wire::Payload::NestedRelationAffirm { reply, message } => {
            Payload::AcceptNestedRelationship {
                inner: message,
                thread_id: reply,
            }
        }
    };

    Ok((
        thread_id,
        (nonconfidential_data, payload, crypto_type, signature_type),
    ))
}
