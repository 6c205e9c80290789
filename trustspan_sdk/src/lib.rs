#![deny(rustdoc::broken_intra_doc_links)]

//! # Trust Spanning Protocol
//!
//! The Trust Spanning Protocol (TSP) is a protocol for secure communication
//! between entities identified by their verified identifiers (VIDs).
//!
//! The primary API this crate exposes is the [AsyncStore] struct, which
//! manages VIDs and relationships inside an encrypted wallet and seals and
//! opens messages between them.
//!
//! ## Core protocol
//!
//! If your use-case only requires the core protocol, you can disable the
//! `async` feature to remove the wallet and resolve methods.
//!
//! The [Store] struct implements managing VIDs and sealing / opening
//! TSP messages (low level API); it does not require an async runtime.
//!
//! ## Example
//!
//! The following example demonstrates how to send a message from Alice to Bob
//!
//! ```rust
//! use trustspan_sdk::{OwnedVid, ReceivedMessage, Store, VerifiedVid};
//!
//! let alice_store = Store::new();
//! let alice = OwnedVid::new_did_peer("tcp://127.0.0.1:1337".parse().unwrap());
//! alice_store.add_private_vid(alice.clone(), None, None).unwrap();
//!
//! let bob_store = Store::new();
//! let bob = OwnedVid::new_did_peer("tcp://127.0.0.1:1338".parse().unwrap());
//! bob_store.add_private_vid(bob.clone(), None, None).unwrap();
//!
//! // did:peer identifiers are self-certifying and verified offline
//! alice_store.add_verified_vid(bob.vid().clone(), None, None).unwrap();
//! bob_store.add_verified_vid(alice.vid().clone(), None, None).unwrap();
//!
//! let (_endpoint, mut sealed) = alice_store
//!     .seal_message(alice.identifier(), bob.identifier(), None, b"hello world")
//!     .unwrap();
//!
//! let ReceivedMessage::GenericMessage { sender, message, .. } =
//!     bob_store.open_message(&mut sealed).unwrap()
//! else {
//!     panic!("bob did not receive a generic message")
//! };
//!
//! assert_eq!(sender, alice.identifier());
//! assert_eq!(message, b"hello world");
//! ```

/// The cryptographic core of the protocol
///   - non-confidential messages signed using Ed25519
///   - confidential messages encrypted with NaCl-style authenticated
///     encryption (X25519 key agreement with XChaCha20-Poly1305 as the
///     underlying AEAD scheme), and signed using Ed25519 to achieve
///     non-repudiation
pub mod crypto;

/// Common data structures and traits that are used throughout the project
pub mod definitions;
mod error;
mod relationship;
mod store;

/// The binary envelope format: encoding and decoding of sealed messages
pub mod wire;

/// Handling of *verified identifiers* and identities; an extended form of
/// `did:web` and the self-certifying `did:peer` are supported
pub mod vid;

#[cfg(feature = "async")]
mod async_store;

#[cfg(feature = "async")]
mod storage;

#[cfg(feature = "async")]
pub use async_store::AsyncStore;

#[cfg(feature = "async")]
pub use storage::{AskarWallet, WalletStorage};

pub use definitions::{Payload, PrivateVid, ReceivedMessage, VerifiedVid};
pub use error::Error;
pub use relationship::RelationshipState;
pub use store::{Aliases, ExportVid, KvEntries, Store, WalletExport};
pub use vid::{OwnedVid, Vid};
