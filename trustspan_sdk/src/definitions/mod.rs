use bytes::BytesMut;
use core::fmt;
use std::{fmt::Debug, ops::Deref};
use zeroize::Zeroize;

pub type Digest = [u8; 32];

/// Correlation token binding a relationship request to its accept or cancel.
/// It is the Blake2b-256 digest of the request's plaintext control payload,
/// which embeds a fresh random nonce.
pub type ThreadId = Digest;

pub const PRIVATE_KEY_SIZE: usize = 32;
pub const PUBLIC_KEY_SIZE: usize = 32;
pub const PRIVATE_SIGNING_KEY_SIZE: usize = 32;
pub const PUBLIC_VERIFICATION_KEY_SIZE: usize = 32;

/// X25519 decryption key
#[derive(Clone, Zeroize)]
pub struct PrivateKeyData([u8; PRIVATE_KEY_SIZE]);

/// X25519 encryption key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyData([u8; PUBLIC_KEY_SIZE]);

/// Ed25519 signing key
#[derive(Clone, Zeroize)]
pub struct PrivateSigningKeyData([u8; PRIVATE_SIGNING_KEY_SIZE]);

/// Ed25519 verification key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicVerificationKeyData([u8; PUBLIC_VERIFICATION_KEY_SIZE]);

pub type VidData<'a> = &'a [u8];
pub type NonConfidentialData<'a> = &'a [u8];
pub type SealedMessage = Vec<u8>;

/// The cryptographic modes that were actually used on a received message;
/// callers can assert a minimum strength (e.g. reject `Plaintext`).
#[derive(Debug)]
pub struct MessageType {
    pub crypto_type: crate::wire::CryptoType,
    pub signature_type: crate::wire::SignatureType,
}

mod conversions;

/// A decoded inbound message. This is a closed enum: every new wire variant
/// forces a compile-time decision at the call sites that match on it.
#[derive(Debug)]
pub enum ReceivedMessage<Data: AsRef<[u8]> = BytesMut> {
    /// A free-form application payload between two VIDs.
    GenericMessage {
        sender: String,
        receiver: Option<String>,
        nonconfidential_data: Option<Data>,
        message: Data,
        message_type: MessageType,
    },
    /// Handshake step 1.
    RequestRelationship {
        sender: String,
        receiver: String,
        route: Option<Vec<Vec<u8>>>,
        nested_vid: Option<String>,
        thread_id: ThreadId,
    },
    /// Handshake step 2, echoing the request's thread id.
    AcceptRelationship {
        sender: String,
        receiver: String,
        nested_vid: Option<String>,
    },
    /// Relationship teardown; terminal for the pair.
    CancelRelationship {
        sender: String,
        receiver: String,
    },
    /// An instruction for an intermediate hop: we are not the final
    /// recipient, the opaque payload must travel on to `next_hop`.
    ForwardRequest {
        sender: String,
        receiver: String,
        next_hop: String,
        route: Vec<BytesMut>,
        opaque_payload: BytesMut,
    },
    /// A message from a sender we hold no key material for; the payload is
    /// kept so the caller can resolve the VID and retry.
    PendingMessage {
        unknown_vid: String,
        payload: BytesMut,
    },
}

/// The plaintext content of an envelope before sealing / after opening.
#[derive(Debug, PartialEq, Eq)]
pub enum Payload<'a, Bytes: AsRef<[u8]>, MaybeMutBytes: AsRef<[u8]> = Bytes> {
    Content(Bytes),
    NestedMessage(MaybeMutBytes),
    RoutedMessage(Vec<VidData<'a>>, Bytes),
    RequestRelationship {
        route: Option<Vec<VidData<'a>>>,
        thread_id: ThreadId,
    },
    AcceptRelationship {
        thread_id: ThreadId,
    },
    CancelRelationship {
        thread_id: ThreadId,
    },
    RequestNestedRelationship {
        inner: MaybeMutBytes,
        thread_id: ThreadId,
    },
    AcceptNestedRelationship {
        inner: MaybeMutBytes,
        thread_id: ThreadId,
    },
}

impl<Bytes: AsRef<[u8]>, MaybeMutBytes: AsRef<[u8]>> Payload<'_, Bytes, MaybeMutBytes> {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Content(bytes) => bytes.as_ref(),
            Payload::NestedMessage(bytes) => bytes.as_ref(),
            Payload::RoutedMessage(_, bytes) => bytes.as_ref(),
            Payload::RequestRelationship { .. }
            | Payload::AcceptRelationship { .. }
            | Payload::CancelRelationship { .. }
            | Payload::RequestNestedRelationship { .. }
            | Payload::AcceptNestedRelationship { .. } => &[],
        }
    }
}

pub trait VerifiedVid: Send + Sync {
    /// The identifier of this VID (for inclusion in sealed envelopes)
    fn identifier(&self) -> &str;

    /// The transport endpoint associated with this VID
    fn endpoint(&self) -> &url::Url;

    /// The verification key that can check signatures made by this VID
    fn verifying_key(&self) -> &PublicVerificationKeyData;

    /// The encryption key associated with this VID
    fn encryption_key(&self) -> &PublicKeyData;
}

pub trait PrivateVid: VerifiedVid + Send + Sync {
    /// The PRIVATE key used to decrypt data
    fn decryption_key(&self) -> &PrivateKeyData;

    /// The PRIVATE key used to sign data
    fn signing_key(&self) -> &PrivateSigningKeyData;
}

impl Debug for PrivateKeyData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKeyData([redacted])")
    }
}

impl Debug for PrivateSigningKeyData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateSigningKeyData([redacted])")
    }
}

impl AsRef<[u8]> for PrivateKeyData {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for PublicKeyData {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for PrivateSigningKeyData {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for PublicVerificationKeyData {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; PRIVATE_KEY_SIZE]> for PrivateKeyData {
    fn from(data: [u8; PRIVATE_KEY_SIZE]) -> PrivateKeyData {
        PrivateKeyData(data)
    }
}

impl From<[u8; PUBLIC_KEY_SIZE]> for PublicKeyData {
    fn from(data: [u8; PUBLIC_KEY_SIZE]) -> PublicKeyData {
        PublicKeyData(data)
    }
}

impl From<[u8; PRIVATE_SIGNING_KEY_SIZE]> for PrivateSigningKeyData {
    fn from(data: [u8; PRIVATE_SIGNING_KEY_SIZE]) -> PrivateSigningKeyData {
        PrivateSigningKeyData(data)
    }
}

impl From<[u8; PUBLIC_VERIFICATION_KEY_SIZE]> for PublicVerificationKeyData {
    fn from(data: [u8; PUBLIC_VERIFICATION_KEY_SIZE]) -> PublicVerificationKeyData {
        PublicVerificationKeyData(data)
    }
}

impl TryFrom<Vec<u8>> for PrivateKeyData {
    type Error = &'static str;

    fn try_from(data: Vec<u8>) -> Result<Self, Self::Error> {
        <[u8; PRIVATE_KEY_SIZE]>::try_from(data.as_slice())
            .map(PrivateKeyData)
            .map_err(|_| "decryption key is not exactly 32 bytes")
    }
}

impl TryFrom<Vec<u8>> for PublicKeyData {
    type Error = &'static str;

    fn try_from(data: Vec<u8>) -> Result<Self, Self::Error> {
        <[u8; PUBLIC_KEY_SIZE]>::try_from(data.as_slice())
            .map(PublicKeyData)
            .map_err(|_| "encryption key is not exactly 32 bytes")
    }
}

impl TryFrom<Vec<u8>> for PrivateSigningKeyData {
    type Error = &'static str;

    fn try_from(data: Vec<u8>) -> Result<Self, Self::Error> {
        <[u8; PRIVATE_SIGNING_KEY_SIZE]>::try_from(data.as_slice())
            .map(PrivateSigningKeyData)
            .map_err(|_| "signing key is not exactly 32 bytes")
    }
}

impl TryFrom<Vec<u8>> for PublicVerificationKeyData {
    type Error = &'static str;

    fn try_from(data: Vec<u8>) -> Result<Self, Self::Error> {
        <[u8; PUBLIC_VERIFICATION_KEY_SIZE]>::try_from(data.as_slice())
            .map(PublicVerificationKeyData)
            .map_err(|_| "verification key is not exactly 32 bytes")
    }
}

impl Deref for PrivateKeyData {
    type Target = [u8; PRIVATE_KEY_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Deref for PublicKeyData {
    type Target = [u8; PUBLIC_KEY_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Deref for PrivateSigningKeyData {
    type Target = [u8; PRIVATE_SIGNING_KEY_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Deref for PublicVerificationKeyData {
    type Target = [u8; PUBLIC_VERIFICATION_KEY_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
