//! A minimalist binary envelope codec for sealed messages. Fields are tagged
//! and length-prefixed (big endian); this is deliberately not a general
//! purpose serialization format, it only covers what sealed traffic needs.
//!
//! Envelope layout:
//!
//! ```text
//! "TS" | version | crypto type | signature type | flags
//!      | sender (u16 len) [ receiver (u16 len) ] [ nonconfidential (u32 len) ]
//!      [ ciphertext (u32 len) ] | signature (64 bytes)
//! ```
//!
//! The plaintext inside the ciphertext starts with the sender identity
//! (so the signer cannot be swapped out without breaking decryption),
//! followed by a one-byte payload tag and the tag-specific fields.

use std::ops::Range;

pub mod error;

pub use error::{DecodeError, EncodeError};

use crate::definitions::Digest;

const MAGIC: [u8; 2] = *b"TS";
const VERSION: u8 = 1;

const FLAG_RECEIVER: u8 = 1 << 0;
const FLAG_NONCONFIDENTIAL: u8 = 1 << 1;

pub const SIGNATURE_LENGTH: usize = 64;
pub const NONCE_LENGTH: usize = 32;
const DIGEST_LENGTH: usize = 32;

mod msgtype {
    pub const GENERIC: u8 = 0;
    pub const NESTED: u8 = 1;
    pub const ROUTED: u8 = 2;
    pub const REQUEST_RELATIONSHIP: u8 = 3;
    pub const ACCEPT_RELATIONSHIP: u8 = 4;
    pub const CANCEL_RELATIONSHIP: u8 = 5;
    pub const REQUEST_NESTED_RELATIONSHIP: u8 = 6;
    pub const ACCEPT_NESTED_RELATIONSHIP: u8 = 7;
    // reserved for out-of-order/buffered delivery
    pub const PENDING: u8 = 8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CryptoType {
    Plaintext = 0,
    Authcrypt = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SignatureType {
    NoSignature = 0,
    Ed25519 = 1,
}

/// The outer header fields of an envelope.
#[derive(Debug, Clone)]
pub struct Envelope<'a, Vid: AsRef<[u8]>> {
    pub crypto_type: CryptoType,
    pub signature_type: SignatureType,
    pub sender: Vid,
    pub receiver: Option<Vid>,
    pub nonconfidential_data: Option<&'a [u8]>,
}

/// A freshly generated random value embedded in handshake proposals, so two
/// proposals between the same pair never hash to the same thread id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_LENGTH]);

impl Nonce {
    pub fn generate(fill: impl FnOnce(&mut [u8; NONCE_LENGTH])) -> Nonce {
        let mut bytes = [0; NONCE_LENGTH];
        fill(&mut bytes);

        Nonce(bytes)
    }
}

/// The tagged plaintext that travels inside the ciphertext (or, for signed
/// only messages, in the clear).
#[derive(Debug, PartialEq, Eq)]
pub enum Payload<'a, Bytes: AsRef<[u8]>> {
    GenericMessage(Bytes),
    NestedMessage(Bytes),
    RoutedMessage(Vec<&'a [u8]>, Bytes),
    DirectRelationProposal { nonce: Nonce, hops: Vec<&'a [u8]> },
    DirectRelationAffirm { reply: Digest },
    RelationshipCancel { reply: Digest },
    NestedRelationProposal { nonce: Nonce, message: Bytes },
    NestedRelationAffirm { reply: Digest, message: Bytes },
}

/// What kind of envelope a message is, and who it involves, without touching
/// key material.
#[derive(Debug, PartialEq, Eq)]
pub enum EnvelopeType<'a> {
    EncryptedMessage {
        sender: &'a [u8],
        receiver: &'a [u8],
    },
    SignedMessage {
        sender: &'a [u8],
        receiver: Option<&'a [u8]>,
    },
}

/// Everything needed to check the outer signature of an envelope.
#[derive(Debug)]
pub struct VerificationChallenge<'a> {
    pub signed_data: &'a [u8],
    pub signature: &'a [u8],
}

/// A parsed but still sealed envelope: the buffer plus field locations.
/// Verification (via [`CipherView::as_challenge`]) must happen before the
/// buffer is handed out for in-place decryption by [`CipherView::into_opened`].
#[derive(Debug)]
pub struct CipherView<'a> {
    data: &'a mut [u8],
    crypto_type: CryptoType,
    signature_type: SignatureType,
    sender: Range<usize>,
    receiver: Option<Range<usize>>,
    nonconfidential_data: Option<Range<usize>>,
    ciphertext: Option<Range<usize>>,
    signed_data: Range<usize>,
    signature: Range<usize>,
}

#[derive(Debug)]
pub struct DecodedEnvelope<'a> {
    pub envelope: Envelope<'a, &'a [u8]>,
    pub ciphertext: Option<&'a mut [u8]>,
}

#[derive(Debug)]
pub struct DecodedPayload<'a> {
    pub payload: Payload<'a, &'a mut [u8]>,
    pub sender_identity: Option<&'a [u8]>,
}

impl<'a> CipherView<'a> {
    pub fn crypto_type(&self) -> CryptoType {
        self.crypto_type
    }

    pub fn signature_type(&self) -> SignatureType {
        self.signature_type
    }

    pub fn as_challenge(&self) -> VerificationChallenge<'_> {
        VerificationChallenge {
            signed_data: &self.data[self.signed_data.clone()],
            signature: &self.data[self.signature.clone()],
        }
    }

    pub fn into_opened(self) -> DecodedEnvelope<'a> {
        let ciphertext_start = self
            .ciphertext
            .as_ref()
            .map(|r| r.start)
            .unwrap_or(self.data.len());

        let (head, tail) = self.data.split_at_mut(ciphertext_start);
        let head = &*head;

        DecodedEnvelope {
            envelope: Envelope {
                crypto_type: self.crypto_type,
                signature_type: self.signature_type,
                sender: &head[self.sender],
                receiver: self.receiver.map(|r| &head[r]),
                nonconfidential_data: self.nonconfidential_data.map(|r| &head[r]),
            },
            ciphertext: self.ciphertext.map(move |r| &mut tail[..r.len()]),
        }
    }
}

fn encode_vid(vid: &[u8], output: &mut Vec<u8>) -> Result<(), EncodeError> {
    let len = u16::try_from(vid.len()).map_err(|_| EncodeError::VidTooLong)?;
    output.extend_from_slice(&len.to_be_bytes());
    output.extend_from_slice(vid);

    Ok(())
}

fn encode_var_data(data: &[u8], output: &mut Vec<u8>) -> Result<(), EncodeError> {
    let len = u32::try_from(data.len()).map_err(|_| EncodeError::PayloadTooLong)?;
    output.extend_from_slice(&len.to_be_bytes());
    output.extend_from_slice(data);

    Ok(())
}

fn encode_hops(hops: &[&[u8]], output: &mut Vec<u8>) -> Result<(), EncodeError> {
    let count = u8::try_from(hops.len()).map_err(|_| EncodeError::TooManyHops)?;
    output.push(count);
    for hop in hops {
        encode_vid(hop, output)?;
    }

    Ok(())
}

/// Encode the envelope header; the ciphertext and signature sections are
/// appended afterwards with [`encode_ciphertext`] and [`encode_signature`].
pub fn encode_envelope<V: AsRef<[u8]>>(
    envelope: Envelope<'_, V>,
    output: &mut Vec<u8>,
) -> Result<(), EncodeError> {
    output.extend_from_slice(&MAGIC);
    output.push(VERSION);
    output.push(envelope.crypto_type as u8);
    output.push(envelope.signature_type as u8);

    let mut flags = 0;
    if envelope.receiver.is_some() {
        flags |= FLAG_RECEIVER;
    }
    if envelope.nonconfidential_data.is_some() {
        flags |= FLAG_NONCONFIDENTIAL;
    }
    output.push(flags);

    encode_vid(envelope.sender.as_ref(), output)?;
    if let Some(ref receiver) = envelope.receiver {
        encode_vid(receiver.as_ref(), output)?;
    }
    if let Some(data) = envelope.nonconfidential_data {
        encode_var_data(data, output)?;
    }

    Ok(())
}

pub fn encode_ciphertext(ciphertext: &[u8], output: &mut Vec<u8>) -> Result<(), EncodeError> {
    encode_var_data(ciphertext, output)
}

pub fn encode_signature(signature: &[u8; SIGNATURE_LENGTH], output: &mut Vec<u8>) {
    output.extend_from_slice(signature);
}

/// Encode a tagged plaintext payload. The sender identity is embedded first,
/// so a decrypted payload is always bound to the envelope's claimed sender.
pub fn encode_payload<B: AsRef<[u8]>>(
    payload: &Payload<'_, B>,
    sender_identity: Option<&[u8]>,
    output: &mut Vec<u8>,
) -> Result<(), EncodeError> {
    match sender_identity {
        Some(identity) => encode_vid(identity, output)?,
        None => output.extend_from_slice(&0u16.to_be_bytes()),
    }

    match payload {
        Payload::GenericMessage(data) => {
            output.push(msgtype::GENERIC);
            output.extend_from_slice(data.as_ref());
        }
        Payload::NestedMessage(data) => {
            output.push(msgtype::NESTED);
            output.extend_from_slice(data.as_ref());
        }
        Payload::RoutedMessage(hops, data) => {
            output.push(msgtype::ROUTED);
            encode_hops(hops, output)?;
            output.extend_from_slice(data.as_ref());
        }
        Payload::DirectRelationProposal { nonce, hops } => {
            output.push(msgtype::REQUEST_RELATIONSHIP);
            output.extend_from_slice(&nonce.0);
            encode_hops(hops, output)?;
        }
        Payload::DirectRelationAffirm { reply } => {
            output.push(msgtype::ACCEPT_RELATIONSHIP);
            output.extend_from_slice(reply);
        }
        Payload::RelationshipCancel { reply } => {
            output.push(msgtype::CANCEL_RELATIONSHIP);
            output.extend_from_slice(reply);
        }
        Payload::NestedRelationProposal { nonce, message } => {
            output.push(msgtype::REQUEST_NESTED_RELATIONSHIP);
            output.extend_from_slice(&nonce.0);
            output.extend_from_slice(message.as_ref());
        }
        Payload::NestedRelationAffirm { reply, message } => {
            output.push(msgtype::ACCEPT_NESTED_RELATIONSHIP);
            output.extend_from_slice(reply);
            output.extend_from_slice(message.as_ref());
        }
    }

    Ok(())
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn take(&mut self, count: usize) -> Result<Range<usize>, DecodeError> {
        if self.buf.len() - self.pos < count {
            return Err(DecodeError::UnexpectedData);
        }
        let range = self.pos..self.pos + count;
        self.pos += count;

        Ok(range)
    }

    fn take_u8(&mut self) -> Result<u8, DecodeError> {
        let range = self.take(1)?;

        Ok(self.buf[range.start])
    }

    fn take_u16(&mut self) -> Result<usize, DecodeError> {
        let range = self.take(2)?;
        let bytes: [u8; 2] = self.buf[range].try_into().map_err(|_| DecodeError::UnexpectedData)?;

        Ok(u16::from_be_bytes(bytes) as usize)
    }

    fn take_u32(&mut self) -> Result<usize, DecodeError> {
        let range = self.take(4)?;
        let bytes: [u8; 4] = self.buf[range].try_into().map_err(|_| DecodeError::UnexpectedData)?;

        Ok(u32::from_be_bytes(bytes) as usize)
    }

    fn take_digest(&mut self) -> Result<Digest, DecodeError> {
        let range = self.take(DIGEST_LENGTH)?;

        self.buf[range]
            .try_into()
            .map_err(|_| DecodeError::UnexpectedData)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

struct Header {
    crypto_type: CryptoType,
    signature_type: SignatureType,
    sender: Range<usize>,
    receiver: Option<Range<usize>>,
    nonconfidential_data: Option<Range<usize>>,
}

fn decode_header(cursor: &mut Cursor) -> Result<Header, DecodeError> {
    let magic = cursor.take(2)?;
    if cursor.buf[magic] != MAGIC {
        return Err(DecodeError::InvalidPrefix);
    }

    let version = cursor.take_u8()?;
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let crypto_type = match cursor.take_u8()? {
        0 => CryptoType::Plaintext,
        1 => CryptoType::Authcrypt,
        other => return Err(DecodeError::UnknownCryptoType(other)),
    };

    let signature_type = match cursor.take_u8()? {
        0 => SignatureType::NoSignature,
        1 => SignatureType::Ed25519,
        other => return Err(DecodeError::UnknownSignatureType(other)),
    };

    let flags = cursor.take_u8()?;

    let sender_len = cursor.take_u16()?;
    let sender = cursor.take(sender_len)?;

    let receiver = if flags & FLAG_RECEIVER != 0 {
        let len = cursor.take_u16()?;
        Some(cursor.take(len)?)
    } else {
        None
    };

    let nonconfidential_data = if flags & FLAG_NONCONFIDENTIAL != 0 {
        let len = cursor.take_u32()?;
        Some(cursor.take(len)?)
    } else {
        None
    };

    Ok(Header {
        crypto_type,
        signature_type,
        sender,
        receiver,
        nonconfidential_data,
    })
}

/// Classify a message by its header only, exposing the claimed sender and
/// receiver without touching any key material.
pub fn probe(message: &[u8]) -> Result<EnvelopeType<'_>, DecodeError> {
    let mut cursor = Cursor::new(message);
    let header = decode_header(&mut cursor)?;

    let sender = &message[header.sender];
    let receiver = header.receiver.map(|r| &message[r]);

    match header.crypto_type {
        CryptoType::Plaintext => Ok(EnvelopeType::SignedMessage { sender, receiver }),
        CryptoType::Authcrypt => Ok(EnvelopeType::EncryptedMessage {
            sender,
            receiver: receiver.ok_or(DecodeError::UnexpectedData)?,
        }),
    }
}

/// Fully parse an envelope, yielding a view that can be verified and then
/// opened in place. Trailing bytes after the signature are rejected.
pub fn decode_envelope(data: &mut [u8]) -> Result<CipherView<'_>, DecodeError> {
    let mut cursor = Cursor::new(data);
    let header = decode_header(&mut cursor)?;

    let ciphertext = match header.crypto_type {
        CryptoType::Plaintext => None,
        CryptoType::Authcrypt => {
            let len = cursor.take_u32()?;
            Some(cursor.take(len)?)
        }
    };

    let signed_data = 0..cursor.pos;

    let signature = match header.signature_type {
        SignatureType::NoSignature => return Err(DecodeError::MissingSignature),
        SignatureType::Ed25519 => cursor.take(SIGNATURE_LENGTH)?,
    };

    if cursor.remaining() != 0 {
        return Err(DecodeError::TrailingData);
    }

    Ok(CipherView {
        data,
        crypto_type: header.crypto_type,
        signature_type: header.signature_type,
        sender: header.sender,
        receiver: header.receiver,
        nonconfidential_data: header.nonconfidential_data,
        ciphertext,
        signed_data,
        signature,
    })
}

fn skip_hops(cursor: &mut Cursor) -> Result<(), DecodeError> {
    let count = cursor.take_u8()?;
    for _ in 0..count {
        let len = cursor.take_u16()?;
        cursor.take(len)?;
    }

    Ok(())
}

fn read_hops<'a>(cursor: &mut Cursor, buf: &'a [u8]) -> Result<Vec<&'a [u8]>, DecodeError> {
    let count = cursor.take_u8()?;
    let mut hops = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = cursor.take_u16()?;
        hops.push(&buf[cursor.take(len)?]);
    }

    Ok(hops)
}

/// Decode a tagged plaintext payload, handing out the opaque remainder as a
/// mutable slice so nested envelopes can be opened in place.
pub fn decode_payload(data: &mut [u8]) -> Result<DecodedPayload<'_>, DecodeError> {
    use msgtype::*;

    // first pass: find where the parsed prefix ends and the opaque
    // remainder (inner message bytes) begins
    let (prefix_end, tag) = {
        let mut cursor = Cursor::new(data);
        let identity_len = cursor.take_u16()?;
        cursor.take(identity_len)?;

        let tag = cursor.take_u8()?;
        match tag {
            GENERIC | NESTED => {}
            ROUTED => skip_hops(&mut cursor)?,
            REQUEST_RELATIONSHIP => {
                cursor.take(NONCE_LENGTH)?;
                skip_hops(&mut cursor)?;
            }
            ACCEPT_RELATIONSHIP | CANCEL_RELATIONSHIP => {
                cursor.take(DIGEST_LENGTH)?;
            }
            REQUEST_NESTED_RELATIONSHIP => {
                cursor.take(NONCE_LENGTH)?;
            }
            ACCEPT_NESTED_RELATIONSHIP => {
                cursor.take(DIGEST_LENGTH)?;
            }
            PENDING => return Err(DecodeError::Reserved(tag)),
            other => return Err(DecodeError::UnknownVariant(other)),
        }

        (cursor.pos, tag)
    };

    let (prefix, remainder) = data.split_at_mut(prefix_end);
    let prefix = &*prefix;

    // second pass over the (now immutable) prefix
    let mut cursor = Cursor::new(prefix);
    let identity_len = cursor.take_u16()?;
    let sender_identity = if identity_len == 0 {
        None
    } else {
        Some(&prefix[cursor.take(identity_len)?])
    };
    let _ = cursor.take_u8()?;

    let payload = match tag {
        GENERIC => Payload::GenericMessage(remainder),
        NESTED => Payload::NestedMessage(remainder),
        ROUTED => Payload::RoutedMessage(read_hops(&mut cursor, prefix)?, remainder),
        REQUEST_RELATIONSHIP => {
            let nonce_range = cursor.take(NONCE_LENGTH)?;
            let nonce = Nonce(
                prefix[nonce_range]
                    .try_into()
                    .map_err(|_| DecodeError::UnexpectedData)?,
            );
            let hops = read_hops(&mut cursor, prefix)?;
            if !remainder.is_empty() {
                return Err(DecodeError::TrailingData);
            }
            Payload::DirectRelationProposal { nonce, hops }
        }
        ACCEPT_RELATIONSHIP => {
            let reply = cursor.take_digest()?;
            if !remainder.is_empty() {
                return Err(DecodeError::TrailingData);
            }
            Payload::DirectRelationAffirm { reply }
        }
        CANCEL_RELATIONSHIP => {
            let reply = cursor.take_digest()?;
            if !remainder.is_empty() {
                return Err(DecodeError::TrailingData);
            }
            Payload::RelationshipCancel { reply }
        }
        REQUEST_NESTED_RELATIONSHIP => {
            let nonce_range = cursor.take(NONCE_LENGTH)?;
            let nonce = Nonce(
                prefix[nonce_range]
                    .try_into()
                    .map_err(|_| DecodeError::UnexpectedData)?,
            );
            Payload::NestedRelationProposal {
                nonce,
                message: remainder,
            }
        }
        ACCEPT_NESTED_RELATIONSHIP => Payload::NestedRelationAffirm {
            reply: cursor.take_digest()?,
            message: remainder,
        },
        // both arms already rejected in the first pass
        _ => return Err(DecodeError::UnknownVariant(tag)),
    };

    Ok(DecodedPayload {
        payload,
        sender_identity,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn dummy_envelope<'a>(
        crypto_type: CryptoType,
        nonconfidential_data: Option<&'a [u8]>,
    ) -> Envelope<'a, &'static [u8]> {
        Envelope {
            crypto_type,
            signature_type: SignatureType::Ed25519,
            sender: b"did:test:alice",
            receiver: Some(b"did:test:bob"),
            nonconfidential_data,
        }
    }

    #[test]
    fn envelope_round_trip() {
        let mut data = Vec::new();
        encode_envelope(dummy_envelope(CryptoType::Authcrypt, Some(b"extra")), &mut data).unwrap();
        encode_ciphertext(b"not really ciphertext", &mut data).unwrap();
        encode_signature(&[5u8; SIGNATURE_LENGTH], &mut data);

        let view = decode_envelope(&mut data).unwrap();
        assert_eq!(view.crypto_type(), CryptoType::Authcrypt);
        assert_eq!(view.signature_type(), SignatureType::Ed25519);

        let challenge = view.as_challenge();
        assert_eq!(challenge.signature, &[5u8; SIGNATURE_LENGTH]);
        assert_eq!(challenge.signed_data.len(), data.len() - SIGNATURE_LENGTH);

        let view = decode_envelope(&mut data).unwrap();
        let opened = view.into_opened();
        assert_eq!(opened.envelope.sender, b"did:test:alice");
        assert_eq!(opened.envelope.receiver, Some(b"did:test:bob".as_slice()));
        assert_eq!(opened.envelope.nonconfidential_data, Some(b"extra".as_slice()));
        assert_eq!(opened.ciphertext.unwrap(), b"not really ciphertext");
    }

    #[test]
    fn probe_signed_and_encrypted() {
        let mut data = Vec::new();
        encode_envelope(dummy_envelope(CryptoType::Authcrypt, None), &mut data).unwrap();

        match probe(&data).unwrap() {
            EnvelopeType::EncryptedMessage { sender, receiver } => {
                assert_eq!(sender, b"did:test:alice");
                assert_eq!(receiver, b"did:test:bob");
            }
            other => panic!("unexpected envelope type: {other:?}"),
        }

        let mut data = Vec::new();
        let envelope = Envelope {
            crypto_type: CryptoType::Plaintext,
            signature_type: SignatureType::Ed25519,
            sender: b"did:test:alice".as_slice(),
            receiver: None,
            nonconfidential_data: Some(b"broadcast"),
        };
        encode_envelope(envelope, &mut data).unwrap();

        match probe(&data).unwrap() {
            EnvelopeType::SignedMessage { sender, receiver } => {
                assert_eq!(sender, b"did:test:alice");
                assert_eq!(receiver, None);
            }
            other => panic!("unexpected envelope type: {other:?}"),
        }
    }

    #[test]
    fn trailing_data_is_rejected() {
        let mut data = Vec::new();
        encode_envelope(dummy_envelope(CryptoType::Authcrypt, None), &mut data).unwrap();
        encode_ciphertext(b"ciphertext", &mut data).unwrap();
        encode_signature(&[0u8; SIGNATURE_LENGTH], &mut data);
        data.push(0xff);

        assert!(matches!(
            decode_envelope(&mut data),
            Err(DecodeError::TrailingData)
        ));
    }

    #[test]
    fn truncated_envelope_is_rejected() {
        let mut data = Vec::new();
        encode_envelope(dummy_envelope(CryptoType::Authcrypt, None), &mut data).unwrap();
        encode_ciphertext(b"ciphertext", &mut data).unwrap();
        encode_signature(&[0u8; SIGNATURE_LENGTH], &mut data);
        data.truncate(data.len() - 1);

        assert!(matches!(
            decode_envelope(&mut data),
            Err(DecodeError::UnexpectedData)
        ));
    }

    #[test]
    fn bad_prefix_is_rejected() {
        let mut data = vec![b'X', b'X', VERSION, 1, 1, 0];
        assert!(matches!(
            decode_envelope(&mut data),
            Err(DecodeError::InvalidPrefix)
        ));
    }

    fn payload_round_trip(payload: Payload<'_, &[u8]>) {
        let mut data = Vec::new();
        encode_payload(&payload, Some(b"did:test:alice"), &mut data).unwrap();

        let decoded = decode_payload(&mut data).unwrap();
        assert_eq!(decoded.sender_identity, Some(b"did:test:alice".as_slice()));

        // compare against the immutable starting point
        let mut expected = Vec::new();
        encode_payload(&payload, Some(b"did:test:alice"), &mut expected).unwrap();
        let mut re_encoded = Vec::new();
        match decoded.payload {
            Payload::GenericMessage(m) => {
                encode_payload::<&[u8]>(
                    &Payload::GenericMessage(&*m),
                    Some(b"did:test:alice"),
                    &mut re_encoded,
                )
                .unwrap();
            }
            Payload::NestedMessage(m) => {
                encode_payload::<&[u8]>(
                    &Payload::NestedMessage(&*m),
                    Some(b"did:test:alice"),
                    &mut re_encoded,
                )
                .unwrap();
            }
            Payload::RoutedMessage(hops, m) => {
                encode_payload::<&[u8]>(
                    &Payload::RoutedMessage(hops, &*m),
                    Some(b"did:test:alice"),
                    &mut re_encoded,
                )
                .unwrap();
            }
            Payload::DirectRelationProposal { nonce, hops } => {
                encode_payload::<&[u8]>(
                    &Payload::DirectRelationProposal { nonce, hops },
                    Some(b"did:test:alice"),
                    &mut re_encoded,
                )
                .unwrap();
            }
            Payload::DirectRelationAffirm { reply } => {
                encode_payload::<&[u8]>(
                    &Payload::DirectRelationAffirm { reply },
                    Some(b"did:test:alice"),
                    &mut re_encoded,
                )
                .unwrap();
            }
            Payload::RelationshipCancel { reply } => {
                encode_payload::<&[u8]>(
                    &Payload::RelationshipCancel { reply },
                    Some(b"did:test:alice"),
                    &mut re_encoded,
                )
                .unwrap();
            }
            Payload::NestedRelationProposal { nonce, message } => {
                encode_payload::<&[u8]>(
                    &Payload::NestedRelationProposal {
                        nonce,
                        message: &*message,
                    },
                    Some(b"did:test:alice"),
                    &mut re_encoded,
                )
                .unwrap();
            }
            Payload::NestedRelationAffirm { reply, message } => {
                encode_payload::<&[u8]>(
                    &Payload::NestedRelationAffirm {
                        reply,
                        message: &*message,
                    },
                    Some(b"did:test:alice"),
                    &mut re_encoded,
                )
                .unwrap();
            }
        }
        assert_eq!(expected, re_encoded);
    }

    #[test]
    fn payload_variants_round_trip() {
        let nonce = Nonce::generate(|dst| dst.copy_from_slice(&[7; NONCE_LENGTH]));

        payload_round_trip(Payload::GenericMessage(b"hello world".as_slice()));
        payload_round_trip(Payload::NestedMessage(b"inner envelope".as_slice()));
        payload_round_trip(Payload::RoutedMessage(
            vec![b"did:test:hop1".as_slice(), b"did:test:hop2"],
            b"opaque".as_slice(),
        ));
        payload_round_trip(Payload::DirectRelationProposal {
            nonce,
            hops: vec![],
        });
        payload_round_trip(Payload::DirectRelationAffirm { reply: [1; 32] });
        payload_round_trip(Payload::RelationshipCancel { reply: [2; 32] });
        payload_round_trip(Payload::NestedRelationProposal {
            nonce,
            message: b"inner".as_slice(),
        });
        payload_round_trip(Payload::NestedRelationAffirm {
            reply: [3; 32],
            message: b"inner".as_slice(),
        });
    }

    #[test]
    fn unknown_payload_tag_is_rejected() {
        let mut data = Vec::new();
        encode_payload::<&[u8]>(
            &Payload::GenericMessage(b"hi"),
            Some(b"did:test:alice"),
            &mut data,
        )
        .unwrap();

        // the tag sits right after the length-prefixed identity
        let tag_offset = 2 + b"did:test:alice".len();
        data[tag_offset] = 0x7f;

        assert!(matches!(
            decode_payload(&mut data),
            Err(DecodeError::UnknownVariant(0x7f))
        ));
    }

    #[test]
    fn reserved_payload_tag_is_rejected() {
        let mut data = Vec::new();
        encode_payload::<&[u8]>(
            &Payload::GenericMessage(b"hi"),
            Some(b"did:test:alice"),
            &mut data,
        )
        .unwrap();

        let tag_offset = 2 + b"did:test:alice".len();
        data[tag_offset] = 8;

        assert!(matches!(
            decode_payload(&mut data),
            Err(DecodeError::Reserved(8))
        ));
    }

    #[test]
    fn accept_with_trailing_bytes_is_rejected() {
        let mut data = Vec::new();
        encode_payload::<&[u8]>(
            &Payload::DirectRelationAffirm { reply: [9; 32] },
            None,
            &mut data,
        )
        .unwrap();
        data.push(0);

        assert!(matches!(
            decode_payload(&mut data),
            Err(DecodeError::TrailingData)
        ));
    }
}
