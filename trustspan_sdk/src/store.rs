use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, hash_map::Entry},
    fmt::Display,
    sync::{Arc, RwLock},
};
use url::Url;

use crate::{
    OwnedVid, Vid,
    crypto::CryptoError,
    definitions::{Digest, MessageType, Payload, PrivateVid, ReceivedMessage, VerifiedVid},
    error::Error,
    relationship::{RelationshipEvent, RelationshipState, transition},
    vid::{VidError, verify_vid_offline},
    wire::{self, EnvelopeType},
};

/// Seal `payload` and report the digest of its plaintext if requested.
fn seal_and_maybe_hash(
    sender: &dyn PrivateVid,
    receiver: &dyn VerifiedVid,
    nonconfidential_data: Option<&[u8]>,
    payload: Payload<&[u8]>,
    digest: Option<&mut Digest>,
) -> Result<Vec<u8>, CryptoError> {
    match digest {
        Some(digest) => {
            crate::crypto::seal_and_hash(sender, receiver, nonconfidential_data, payload, digest)
        }
        None => crate::crypto::seal(sender, receiver, nonconfidential_data, payload),
    }
}

/// Everything the store tracks about a single VID.
#[derive(Clone)]
pub(crate) struct VidContext {
    vid: Arc<dyn VerifiedVid>,
    private: Option<Arc<dyn PrivateVid>>,
    relation_state: RelationshipState,
    relation_vid: Option<String>,
    parent_vid: Option<String>,
    tunnel: Option<Box<[String]>>,
    metadata: Option<serde_json::Value>,
}

impl VidContext {
    /// Set the parent VID for this VID, making it a nested VID
    fn set_parent_vid(&mut self, parent_vid: Option<&str>) {
        self.parent_vid = parent_vid.map(|r| r.to_string());
    }

    /// Set the relation VID for this VID. The relation VID will be used as
    /// sender VID when sending messages to this VID
    fn set_relation_vid(&mut self, relation_vid: Option<&str>) {
        self.relation_vid = relation_vid.map(|r| r.to_string());
    }

    /// Set the route for this VID. The route will be used to send routed
    /// messages to this VID
    fn set_route(&mut self, route: Vec<String>) {
        if route.is_empty() {
            self.tunnel = None;
        } else {
            self.tunnel = Some(route.into_boxed_slice());
        }
    }

    pub(crate) fn get_parent_vid(&self) -> Option<&str> {
        self.parent_vid.as_deref()
    }

    pub(crate) fn get_relation_vid(&self) -> Option<&str> {
        self.relation_vid.as_deref()
    }

    pub(crate) fn get_route(&self) -> Option<&[String]> {
        self.tunnel.as_deref()
    }

    pub(crate) fn relation_state(&self) -> &RelationshipState {
        &self.relation_state
    }
}

pub type Aliases = HashMap<String, String>;
pub type KvEntries = HashMap<String, Vec<u8>>;

/// The serializable snapshot of everything the store knows about one VID;
/// this is what gets persisted to (and restored from) a wallet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportVid {
    pub vid: Vid,
    pub private: Option<OwnedVid>,
    pub relation_state: RelationshipState,
    pub relation_vid: Option<String>,
    pub parent_vid: Option<String>,
    pub tunnel: Option<Box<[String]>>,
    pub metadata: Option<serde_json::Value>,
}

/// A full wallet snapshot: VIDs, aliases and application key-value entries.
pub type WalletExport = (Vec<ExportVid>, Aliases, KvEntries);

/// Holds private and verified VIDs.
///
/// A store contains verified VIDs, our relationship state with them, the
/// private VIDs this application controls, and auxiliary data (aliases,
/// application key-value entries). It is the primary interface for sealing
/// and opening messages in a synchronous context; in-memory only, see
/// [`AsyncStore`](crate::AsyncStore) for a persistent wallet.
#[derive(Default, Clone)]
pub struct Store {
    vids: Arc<RwLock<HashMap<String, VidContext>>>,
    aliases: Arc<RwLock<Aliases>>,
    kv: Arc<RwLock<KvEntries>>,
}

impl Store {
    /// Create a new, empty store
    pub fn new() -> Self {
        Default::default()
    }

    /// Export the store to serializable types
    pub fn export(&self) -> Result<WalletExport, Error> {
        let vids = self
            .vids
            .read()?
            .values()
            .map(|context| ExportVid {
                vid: Vid::from_verified_vid(&*context.vid),
                private: context
                    .private
                    .as_ref()
                    .map(|private| OwnedVid::from_private_vid(&**private)),
                relation_state: context.relation_state.clone(),
                relation_vid: context.relation_vid.clone(),
                parent_vid: context.parent_vid.clone(),
                tunnel: context.tunnel.clone(),
                metadata: context.metadata.clone(),
            })
            .collect::<Vec<_>>();

        Ok((vids, self.aliases.read()?.clone(), self.kv.read()?.clone()))
    }

    /// Import a wallet snapshot into the store
    pub fn import(&self, (vids, aliases, kv): WalletExport) -> Result<(), Error> {
        {
            let mut lock = self.vids.write()?;
            for entry in vids {
                lock.insert(
                    entry.vid.identifier().to_string(),
                    VidContext {
                        private: entry
                            .private
                            .map(|private| -> Arc<dyn PrivateVid> { Arc::new(private) }),
                        vid: Arc::new(entry.vid),
                        relation_state: entry.relation_state,
                        relation_vid: entry.relation_vid,
                        parent_vid: entry.parent_vid,
                        tunnel: entry.tunnel,
                        metadata: entry.metadata,
                    },
                );
            }
        }

        self.aliases.write()?.extend(aliases);
        self.kv.write()?.extend(kv);

        Ok(())
    }

    /// Add the already resolved `verified_vid` to the store.
    /// Re-registering a VID that we hold private keys for is refused, so key
    /// material is never silently dropped.
    pub fn add_verified_vid(
        &self,
        verified_vid: impl VerifiedVid + 'static,
        alias: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), Error> {
        let did = verified_vid.identifier().to_string();
        let verified_vid = Arc::new(verified_vid);

        match self.vids.write()?.entry(did.clone()) {
            Entry::Occupied(mut entry) => {
                let context = entry.get_mut();
                if context.private.is_some() {
                    return Err(Error::DuplicateIdentifier(did));
                }
                context.vid = verified_vid;
                context.metadata = metadata;
            }
            Entry::Vacant(slot) => {
                slot.insert(VidContext {
                    vid: verified_vid,
                    private: None,
                    relation_state: RelationshipState::NoRelation,
                    relation_vid: None,
                    parent_vid: None,
                    tunnel: None,
                    metadata,
                });
            }
        }

        if let Some(alias) = alias {
            self.set_alias(alias, did)?;
        }

        Ok(())
    }

    /// Register the public half of an identity we control, e.g. to hand its
    /// store to a party that should be able to address us but not sign for us.
    pub fn add_verified_owned_vid(
        &self,
        owned_vid: &OwnedVid,
        alias: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), Error> {
        self.add_verified_vid(owned_vid.vid().clone(), alias, metadata)
    }

    /// Add `private_vid` to the store. Re-adding the exact same identity is
    /// idempotent; registering different key material (or a VID previously
    /// known only as verified) under the same identifier is refused.
    pub fn add_private_vid(
        &self,
        private_vid: impl PrivateVid + 'static,
        alias: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), Error> {
        let vid = Arc::new(private_vid);
        let did = vid.identifier().to_string();

        match self.vids.write()?.entry(did.clone()) {
            Entry::Occupied(mut entry) => {
                let context = entry.get_mut();
                let same_keys = context.vid.verifying_key() == vid.verifying_key()
                    && context.vid.encryption_key() == vid.encryption_key();

                if context.private.is_none() || !same_keys {
                    return Err(Error::DuplicateIdentifier(did));
                }

                context.metadata = metadata;
            }
            Entry::Vacant(slot) => {
                slot.insert(VidContext {
                    vid: vid.clone(),
                    private: Some(vid),
                    relation_state: RelationshipState::NoRelation,
                    relation_vid: None,
                    parent_vid: None,
                    tunnel: None,
                    metadata,
                });
            }
        }

        if let Some(alias) = alias {
            self.set_alias(alias, did)?;
        }

        Ok(())
    }

    /// Remove a VID from the store
    pub fn forget_vid(&self, vid: &str) -> Result<(), Error> {
        let vid = self.try_resolve_alias(vid)?;

        match self.vids.write()?.remove(&vid) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(vid)),
        }
    }

    /// Sets the parent for a VID, making it a nested VID
    pub fn set_parent_for_vid(&self, vid: &str, parent_vid: Option<&str>) -> Result<(), Error> {
        let parent_vid = if let Some(parent_vid) = parent_vid {
            Some(self.try_resolve_alias(parent_vid)?)
        } else {
            None
        };

        self.modify_vid(vid, |resolved| {
            resolved.set_parent_vid(parent_vid.as_deref());

            Ok(())
        })
    }

    /// The relationship state of the pair `(local_vid, remote_vid)`.
    pub fn relation_state_for_vid_pair(
        &self,
        local_vid: &str,
        remote_vid: &str,
    ) -> Result<RelationshipState, Error> {
        let local_vid = self.try_resolve_alias(local_vid)?;
        let remote_vid = self.try_resolve_alias(remote_vid)?;

        if let Some((_, context)) = self.vids.read()?.iter().find(|(r_vid, context)| {
            (**r_vid == remote_vid) && (context.relation_vid.as_deref() == Some(&local_vid))
        }) {
            Ok(context.relation_state.clone())
        } else {
            Ok(RelationshipState::NoRelation)
        }
    }

    /// List all VIDs in the store
    pub fn list_vids(&self) -> Result<Vec<String>, Error> {
        Ok(self.vids.read()?.keys().cloned().collect())
    }

    /// Record a relationship with `vid` that was established out-of-band:
    /// messages to `vid` will be sent as `relation_vid`.
    pub fn set_relation_for_vid(&self, vid: &str, relation_vid: &str) -> Result<(), Error> {
        self.set_relation_and_state_for_vid(
            vid,
            RelationshipState::Established {
                thread_id: Default::default(),
                outstanding_nested_threads: vec![],
            },
            relation_vid,
        )
    }

    /// Sets the relationship state and relation for a VID
    pub(crate) fn set_relation_and_state_for_vid(
        &self,
        vid: &str,
        relation_state: RelationshipState,
        relation_vid: &str,
    ) -> Result<(), Error> {
        let relation_vid = self.try_resolve_alias(relation_vid)?;
        self.modify_vid(vid, |resolved| {
            resolved.set_relation_vid(Some(&relation_vid));
            resolved.relation_state = relation_state;

            Ok(())
        })
    }

    /// Adds a route to an already existing VID; messages to it will travel
    /// through the listed intermediaries. A route of length one is invalid:
    /// the first hop needs at least a drop-off point after it.
    pub fn set_route_for_vid(
        &self,
        vid: &str,
        route: impl IntoIterator<Item: ToString, IntoIter: ExactSizeIterator<Item = impl Display>>,
    ) -> Result<(), Error> {
        let route = route.into_iter();
        if route.len() == 1 {
            return Err(Error::MalformedRoute(
                "a route must have at least two VIDs".into(),
            ));
        }

        self.modify_vid(vid, |resolved| {
            resolved.set_route(route.map(|x| x.to_string()).collect());

            Ok(())
        })
    }

    /// Modify a VID context by applying an operation to it (internal use only)
    pub(crate) fn modify_vid<T>(
        &self,
        vid: &str,
        change: impl FnOnce(&mut VidContext) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let vid = self.try_resolve_alias(vid)?;

        match self.vids.write()?.get_mut(&vid) {
            Some(resolved) => change(resolved),
            None => Err(Error::UnverifiedVid(vid.to_string())),
        }
    }

    /// Check whether a private VID identified by `vid` exists in the store
    pub fn has_private_vid(&self, vid: &str) -> Result<bool, Error> {
        match self.get_private_vid(vid) {
            Ok(_) => Ok(true),
            Err(Error::UnverifiedVid(_)) | Err(Error::MissingPrivateVid(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn get_private_vid(&self, vid: &str) -> Result<Arc<dyn PrivateVid>, Error> {
        match self.get_vid(vid)?.private {
            Some(private) => Ok(private),
            None => Err(Error::MissingPrivateVid(vid.to_string())),
        }
    }

    /// Check whether a verified VID identified by `vid` exists in the store
    pub fn has_verified_vid(&self, vid: &str) -> Result<bool, Error> {
        match self.get_verified_vid(vid) {
            Ok(_) => Ok(true),
            Err(Error::UnverifiedVid(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn get_verified_vid(&self, vid: &str) -> Result<Arc<dyn VerifiedVid>, Error> {
        Ok(self.get_vid(vid)?.vid)
    }

    pub(crate) fn get_vid(&self, vid: &str) -> Result<VidContext, Error> {
        let vid = self.try_resolve_alias(vid)?;

        match self.vids.read()?.get(&vid) {
            Some(resolved) => Ok(resolved.clone()),
            None => Err(Error::UnverifiedVid(vid.to_string())),
        }
    }

    /// As [`get_vid`](Store::get_vid), but for use in contexts where an
    /// unknown VID means the message cannot be delivered.
    fn get_recipient(&self, vid: &str) -> Result<VidContext, Error> {
        match self.get_vid(vid) {
            Err(Error::UnverifiedVid(vid)) => Err(Error::UnknownRecipient(vid)),
            other => other,
        }
    }

    /// Resolve an alias to its corresponding DID
    pub fn resolve_alias(&self, alias: &str) -> Result<Option<String>, Error> {
        let aliases = self.aliases.read()?;
        Ok(aliases.get(alias).cloned())
    }

    /// Resolve an alias to its corresponding DID, or leave it as is
    pub fn try_resolve_alias(&self, alias: &str) -> Result<String, Error> {
        Ok(self.resolve_alias(alias)?.unwrap_or(alias.to_owned()))
    }

    /// Set an alias for a DID
    pub fn set_alias(&self, alias: String, did: String) -> Result<(), Error> {
        self.aliases.write()?.insert(alias, did);
        Ok(())
    }

    /// Store an application-defined value under `key`
    pub fn store_kv(&self, key: impl Into<String>, value: Vec<u8>) -> Result<(), Error> {
        self.kv.write()?.insert(key.into(), value);
        Ok(())
    }

    /// Retrieve an application-defined value
    pub fn get_kv(&self, key: &str) -> Result<Vec<u8>, Error> {
        match self.kv.read()?.get(key) {
            Some(value) => Ok(value.clone()),
            None => Err(Error::NotFound(key.to_string())),
        }
    }

    /// Remove an application-defined value; removing an absent key is a no-op
    pub fn remove_kv(&self, key: &str) -> Result<(), Error> {
        self.kv.write()?.remove(key);
        Ok(())
    }

    /// Seal a message addressed to `receiver`. The message is encrypted,
    /// encoded and signed using the key material of the sender and receiver;
    /// both VIDs must already be present in the store. If the receiver is
    /// nested or reached through a route, the envelope is wrapped
    /// accordingly.
    pub fn seal_message(
        &self,
        sender: &str,
        receiver: &str,
        nonconfidential_data: Option<&[u8]>,
        message: &[u8],
    ) -> Result<(Url, Vec<u8>), Error> {
        self.seal_message_payload(
            sender,
            receiver,
            nonconfidential_data,
            Payload::Content(message),
        )
    }

    pub(crate) fn seal_message_payload(
        &self,
        sender: &str,
        receiver: &str,
        nonconfidential_data: Option<&[u8]>,
        payload: Payload<&[u8]>,
    ) -> Result<(Url, Vec<u8>), Error> {
        self.seal_message_payload_and_hash(sender, receiver, nonconfidential_data, payload, None)
    }

    /// Seal a message payload and optionally return the digest of its
    /// plaintext (used as thread id for handshakes).
    pub(crate) fn seal_message_payload_and_hash(
        &self,
        sender: &str,
        receiver: &str,
        nonconfidential_data: Option<&[u8]>,
        payload: Payload<&[u8]>,
        digest: Option<&mut Digest>,
    ) -> Result<(Url, Vec<u8>), Error> {
        let sender = self.get_private_vid(sender)?;
        let receiver_context = self.get_recipient(receiver)?;

        // routed mode: seal for the final receiver, then wrap for the first hop
        if let Some(intermediaries) = receiver_context.get_route() {
            let first_hop = self.get_recipient(&intermediaries[0])?;

            let Some(first_sender) = first_hop.get_relation_vid() else {
                return Err(Error::MalformedRoute(format!(
                    "no relation with first hop {}",
                    first_hop.vid.identifier()
                )));
            };

            let inner_sender = receiver_context
                .get_relation_vid()
                .unwrap_or(sender.identifier());
            let inner_sender = self.get_private_vid(inner_sender)?;

            let inner_message = seal_and_maybe_hash(
                &*inner_sender,
                &*receiver_context.vid,
                nonconfidential_data,
                payload,
                digest,
            )?;

            let first_sender = self.get_private_vid(first_sender)?;

            let hops = intermediaries[1..]
                .iter()
                .map(|x| x.as_ref())
                .collect::<Vec<_>>();

            return self.seal_message_payload(
                first_sender.identifier(),
                first_hop.vid.identifier(),
                None,
                Payload::RoutedMessage(hops, &inner_message),
            );
        }

        // nested mode: the receiver is a nested VID, wrap for its parent
        if let Some(parent_receiver) = receiver_context.get_parent_vid() {
            let Some(inner_sender) = receiver_context.get_relation_vid() else {
                return Err(Error::Relationship(format!(
                    "no relation with nested receiver {receiver}"
                )));
            };

            let sender_context = self.get_vid(inner_sender)?;

            let Some(parent_sender) = sender_context.get_parent_vid() else {
                return Err(Error::Relationship(format!(
                    "missing parent for inner VID {inner_sender}"
                )));
            };

            if parent_sender != sender.identifier() && inner_sender != sender.identifier() {
                return Err(Error::Relationship(format!(
                    "{} cannot send to nested receiver {receiver}",
                    sender.identifier()
                )));
            }

            let inner_sender = self.get_private_vid(inner_sender)?;

            // plain content inside an encrypted outer envelope only needs the
            // inner signature; control payloads stay encrypted end-to-end
            let inner_message = if let Payload::Content(_) = payload {
                crate::crypto::sign(
                    &*inner_sender,
                    Some(&*receiver_context.vid),
                    payload.as_bytes(),
                )?
            } else {
                seal_and_maybe_hash(&*inner_sender, &*receiver_context.vid, None, payload, digest)?
            };

            let parent_sender = self.get_private_vid(parent_sender)?;
            let parent_receiver = self.get_verified_vid(parent_receiver)?;

            return self.seal_message_payload(
                parent_sender.identifier(),
                parent_receiver.identifier(),
                nonconfidential_data,
                Payload::NestedMessage(&inner_message),
            );
        }

        // direct mode
        let message = seal_and_maybe_hash(
            &*sender,
            &*receiver_context.vid,
            nonconfidential_data,
            payload,
            digest,
        )?;

        Ok((receiver_context.vid.endpoint().clone(), message))
    }

    /// Sign an unencrypted message, without a specified recipient
    pub fn sign_anycast(&self, sender: &str, message: &[u8]) -> Result<Vec<u8>, Error> {
        let sender = self.get_private_vid(sender)?;

        Ok(crate::crypto::sign(&*sender, None, message)?)
    }

    /// Resolve a route: extract and verify the next hop, and collect the
    /// remaining hops
    fn resolve_route<'a>(&'a self, hop_list: &'a [&str]) -> Result<(String, Vec<&'a [u8]>), Error> {
        let Some(next_hop) = hop_list.first() else {
            return Err(Error::MalformedRoute(
                "relationship route must not be empty".into(),
            ));
        };

        let next_hop = self.get_verified_vid(next_hop)?.identifier().to_owned();
        let path = hop_list[1..].iter().map(|x| x.as_bytes()).collect();

        Ok((next_hop, path))
    }

    /// Pass along an in-transit routed message that is not meant for us.
    /// With an empty remaining route we are the drop-off point: the payload
    /// is re-sealed as a nested message towards the relation of `next_hop`.
    /// Otherwise we wrap it in a fresh routed envelope towards `next_hop`.
    pub fn forward_routed_message(
        &self,
        next_hop: &str,
        route: Vec<&[u8]>,
        opaque_payload: &[u8],
    ) -> Result<(Url, Vec<u8>), Error> {
        if route.is_empty() {
            // we are the final delivery point; 'next_hop' names our own VID
            let sender = self.get_vid(next_hop)?;

            let Some(sender_private) = &sender.private else {
                return Err(Error::MissingPrivateVid(next_hop.to_string()));
            };

            let recipient = match sender.get_relation_vid() {
                Some(destination) => self.get_verified_vid(destination)?,
                None => {
                    return Err(Error::MalformedRoute(format!(
                        "no drop-off relation for {}",
                        sender.vid.identifier()
                    )));
                }
            };

            self.seal_message_payload(
                sender_private.identifier(),
                recipient.identifier(),
                None,
                Payload::NestedMessage(opaque_payload),
            )
        } else {
            // we are an intermediary; forward towards the next hop
            let next_hop_context = self
                .get_vid(next_hop)
                .map_err(|_| Error::UnknownRecipient(next_hop.to_string()))?;

            let sender = match next_hop_context.get_relation_vid() {
                Some(first_sender) => self.get_private_vid(first_sender)?,
                None => {
                    return Err(Error::MalformedRoute(format!(
                        "no relation with next hop {next_hop}"
                    )));
                }
            };

            self.seal_message_payload(
                sender.identifier(),
                next_hop_context.vid.identifier(),
                None,
                Payload::RoutedMessage(route, opaque_payload),
            )
        }
    }

    /// The claimed sender of a sealed message, from the envelope header
    fn probe_sender(message: &[u8]) -> Result<&str, Error> {
        Ok(match wire::probe(message)? {
            EnvelopeType::EncryptedMessage { sender, .. } => std::str::from_utf8(sender)?,
            EnvelopeType::SignedMessage { sender, .. } => std::str::from_utf8(sender)?,
        })
    }

    /// Decode a sealed `message`, which has to be addressed to a private VID
    /// in this store, and from a sender that has been verified beforehand.
    pub fn open_message<'a>(
        &self,
        message: &'a mut [u8],
    ) -> Result<ReceivedMessage<&'a [u8]>, Error> {
        match wire::probe(message)? {
            EnvelopeType::EncryptedMessage {
                sender,
                receiver: intended_receiver,
            } => {
                let intended_receiver = std::str::from_utf8(intended_receiver)?.to_string();

                let Ok(receiver_pid) = self.get_private_vid(&intended_receiver) else {
                    return Err(CryptoError::UnexpectedRecipient.into());
                };

                let sender = std::str::from_utf8(sender)?.to_string();

                let Ok(sender_vid) = self.get_verified_vid(&sender) else {
                    return Err(Error::UnverifiedSource(sender, None));
                };

                let (_, (nonconfidential_data, payload, crypto_type, signature_type)) =
                    match crate::crypto::open(&*receiver_pid, &*sender_vid, message) {
                        Ok(contents) => contents,
                        Err(CryptoError::Decode(wire::DecodeError::Reserved(_))) => {
                            return Err(Error::Unsupported(
                                "buffered message delivery is reserved",
                            ));
                        }
                        Err(e) => return Err(e.into()),
                    };

                match payload {
                    Payload::Content(message) => Ok(ReceivedMessage::GenericMessage {
                        sender,
                        receiver: Some(intended_receiver),
                        nonconfidential_data,
                        message,
                        message_type: MessageType {
                            crypto_type,
                            signature_type,
                        },
                    }),
                    Payload::NestedMessage(inner) => {
                        // if the inner VID isn't recognized (realistic in
                        // routed mode), hand out the still-sealed inner
                        // message so the caller can verify the VID and retry
                        let inner_vid = Self::probe_sender(inner)?.to_string();
                        if self.get_verified_vid(&inner_vid).is_err() {
                            return Err(Error::UnverifiedSource(
                                inner_vid,
                                Some(BytesMut::from(&inner[..])),
                            ));
                        }

                        let mut received_message = self.open_message(inner)?;

                        // a signed-only inner message counts as confidential
                        // if the encrypted outer envelope came from its parent
                        if let ReceivedMessage::GenericMessage {
                            message_type:
                                ref mut message_type @ MessageType {
                                    crypto_type: wire::CryptoType::Plaintext,
                                    signature_type: _,
                                },
                            sender: ref inner_sender,
                            ..
                        } = received_message
                            && self.get_vid(inner_sender)?.get_parent_vid() == Some(&sender)
                        {
                            message_type.crypto_type = crypto_type;
                        }

                        Ok(received_message)
                    }
                    Payload::RoutedMessage(hops, message) => {
                        let Some(next_hop) = hops.first() else {
                            return Err(Error::MalformedRoute(
                                "routed message without hops".into(),
                            ));
                        };

                        Ok(ReceivedMessage::ForwardRequest {
                            sender,
                            receiver: intended_receiver,
                            next_hop: std::str::from_utf8(next_hop)?.to_string(),
                            route: hops[1..].iter().map(|x| BytesMut::from(*x)).collect(),
                            opaque_payload: BytesMut::from(message),
                        })
                    }
                    Payload::RequestRelationship { route, thread_id } => {
                        Ok(ReceivedMessage::RequestRelationship {
                            sender,
                            receiver: intended_receiver,
                            route: route.map(|vec| vec.iter().map(|vid| vid.to_vec()).collect()),
                            thread_id,
                            nested_vid: None,
                        })
                    }
                    Payload::AcceptRelationship { thread_id } => {
                        self.upgrade_relation(receiver_pid.identifier(), &sender, thread_id)?;

                        Ok(ReceivedMessage::AcceptRelationship {
                            sender,
                            receiver: intended_receiver,
                            nested_vid: None,
                        })
                    }
                    Payload::CancelRelationship { thread_id } => {
                        if let Some(context) = self.vids.write()?.get_mut(&sender) {
                            context.relation_state = transition(
                                &context.relation_state,
                                RelationshipEvent::ReceiveCancel { thread_id },
                            )?;

                            if context.relation_state == RelationshipState::Cancelled {
                                context.relation_vid = None;
                            }
                        }

                        Ok(ReceivedMessage::CancelRelationship {
                            sender,
                            receiver: intended_receiver,
                        })
                    }
                    Payload::RequestNestedRelationship { inner, thread_id } => {
                        let EnvelopeType::SignedMessage {
                            sender: inner_vid,
                            receiver: None,
                        } = wire::probe(inner)?
                        else {
                            return Err(Error::Relationship(
                                "invalid nested request, not a signed introduction".into(),
                            ));
                        };

                        let inner_vid = std::str::from_utf8(inner_vid)?.to_string();

                        self.add_nested_vid(&inner_vid)?;

                        // opening the inner message verifies its signature,
                        // which proves the sender controls the nested VID
                        let _ = self.open_message(inner)?;

                        self.set_parent_for_vid(&inner_vid, Some(&sender))?;

                        Ok(ReceivedMessage::RequestRelationship {
                            sender,
                            receiver: intended_receiver,
                            route: None,
                            thread_id,
                            nested_vid: Some(inner_vid),
                        })
                    }
                    Payload::AcceptNestedRelationship { thread_id, inner } => {
                        let EnvelopeType::SignedMessage {
                            sender: vid,
                            receiver: Some(connect_to_vid),
                        } = wire::probe(inner)?
                        else {
                            return Err(Error::Relationship(
                                "invalid nested accept, not a signed introduction".into(),
                            ));
                        };

                        let vid = std::str::from_utf8(vid)?.to_string();
                        let connect_to_vid = std::str::from_utf8(connect_to_vid)?.to_string();
                        self.add_nested_vid(&vid)?;

                        let _ = self.open_message(inner)?;

                        self.set_parent_for_vid(&vid, Some(&sender))?;
                        self.add_nested_relation(&sender, &vid, thread_id)?;
                        self.set_relation_and_state_for_vid(
                            &connect_to_vid,
                            RelationshipState::Established {
                                thread_id,
                                outstanding_nested_threads: vec![],
                            },
                            &vid,
                        )?;
                        self.set_relation_and_state_for_vid(
                            &vid,
                            RelationshipState::Established {
                                thread_id,
                                outstanding_nested_threads: vec![],
                            },
                            &connect_to_vid,
                        )?;

                        Ok(ReceivedMessage::AcceptRelationship {
                            sender,
                            receiver: intended_receiver,
                            nested_vid: Some(vid),
                        })
                    }
                }
            }
            EnvelopeType::SignedMessage {
                sender,
                receiver: intended_receiver,
            } => {
                let intended_receiver = intended_receiver
                    .map(|intended_receiver| {
                        let intended_receiver = std::str::from_utf8(intended_receiver)?;

                        if !self.has_private_vid(intended_receiver)? {
                            return Err::<_, Error>(CryptoError::UnexpectedRecipient.into());
                        }

                        Ok(intended_receiver.to_string())
                    })
                    .transpose()?;

                let sender = std::str::from_utf8(sender)?.to_string();

                let Ok(sender_vid) = self.get_verified_vid(&sender) else {
                    return Err(Error::UnverifiedVid(sender.to_string()));
                };

                let (message, message_type) = crate::crypto::verify(&*sender_vid, message)?;

                Ok(ReceivedMessage::GenericMessage {
                    sender,
                    receiver: intended_receiver,
                    nonconfidential_data: None,
                    message,
                    message_type,
                })
            }
        }
    }

    /// Start a relationship handshake with `receiver`. The returned thread id
    /// binding is implicit: it is the digest of this request's plaintext.
    pub fn make_relationship_request(
        &self,
        sender: &str,
        receiver: &str,
        route: Option<&[&str]>,
    ) -> Result<(Url, Vec<u8>), Error> {
        let sender = self.get_private_vid(sender)?;
        let receiver = match self.get_verified_vid(receiver) {
            Ok(receiver) => receiver,
            Err(Error::UnverifiedVid(vid)) => return Err(Error::UnknownRecipient(vid)),
            Err(e) => return Err(e),
        };

        let path = route;
        let route = route.map(|collection| collection.iter().map(|vid| vid.as_ref()).collect());

        let mut thread_id = Default::default();
        let message = crate::crypto::seal_and_hash(
            &*sender,
            &*receiver,
            None,
            Payload::RequestRelationship {
                route,
                thread_id: Default::default(),
            },
            &mut thread_id,
        )?;

        let (transport, message) = if let Some(hop_list) = path {
            self.set_route_for_vid(receiver.identifier(), hop_list)?;
            self.resolve_route_and_send(hop_list, &message)?
        } else {
            (receiver.endpoint().clone(), message)
        };

        self.modify_vid(receiver.identifier(), |context| {
            context.relation_state = transition(
                &context.relation_state,
                RelationshipEvent::SendRequest { thread_id },
            )?;
            context.set_relation_vid(Some(sender.identifier()));

            Ok(())
        })?;

        Ok((transport, message))
    }

    /// Accept a relationship request from `receiver`; `thread_id` must echo
    /// the one carried by the request.
    pub fn make_relationship_accept(
        &self,
        sender: &str,
        receiver: &str,
        thread_id: Digest,
        route: Option<&[&str]>,
    ) -> Result<(Url, Vec<u8>), Error> {
        let sender = self.try_resolve_alias(sender)?;

        let (transport, message) = self.seal_message_payload(
            &sender,
            receiver,
            None,
            Payload::AcceptRelationship { thread_id },
        )?;

        let (transport, message) = if let Some(hop_list) = route {
            self.set_route_for_vid(receiver, hop_list)?;
            self.resolve_route_and_send(hop_list, &message)?
        } else {
            (transport, message)
        };

        self.modify_vid(receiver, |context| {
            context.relation_state = transition(
                &context.relation_state,
                RelationshipEvent::SendAccept { thread_id },
            )?;
            context.set_relation_vid(Some(&sender));

            Ok(())
        })?;

        Ok((transport, message))
    }

    /// Cancel the relationship with `receiver`. This is terminal: after the
    /// cancel, no handshake with this pair can succeed anymore.
    pub fn make_relationship_cancel(
        &self,
        sender: &str,
        receiver: &str,
    ) -> Result<(Url, Vec<u8>), Error> {
        let thread_id = self.modify_vid(receiver, |context| {
            let Some(thread_id) = context.relation_state.thread_id() else {
                return Err(Error::Relationship("no relationship to cancel".into()));
            };

            context.relation_state =
                transition(&context.relation_state, RelationshipEvent::SendCancel)?;

            Ok(thread_id)
        })?;

        let (transport, message) = self.seal_message_payload(
            sender,
            receiver,
            None,
            Payload::CancelRelationship { thread_id },
        )?;

        Ok((transport, message))
    }

    /// Start a nested handshake under the established relationship between
    /// `parent_sender` and `receiver`. A fresh nested VID is minted; its
    /// identifier is only ever disclosed inside the encrypted payload.
    pub fn make_nested_relationship_request(
        &self,
        parent_sender: &str,
        receiver: &str,
    ) -> Result<((Url, Vec<u8>), OwnedVid), Error> {
        let sender = self.get_private_vid(parent_sender)?;
        let receiver = match self.get_verified_vid(receiver) {
            Ok(receiver) => receiver,
            Err(Error::UnverifiedVid(vid)) => return Err(Error::UnknownRecipient(vid)),
            Err(e) => return Err(e),
        };

        let nested_vid = self.make_propositioning_vid(sender.identifier())?;

        let inner_message = crate::crypto::sign(&nested_vid, None, &[])?;

        let mut thread_id = Default::default();
        let (endpoint, message) = self.seal_message_payload_and_hash(
            sender.identifier(),
            receiver.identifier(),
            None,
            Payload::RequestNestedRelationship {
                inner: &inner_message,
                thread_id: Default::default(),
            },
            Some(&mut thread_id),
        )?;

        self.add_nested_thread_id(receiver.identifier(), thread_id)?;

        Ok(((endpoint, message), nested_vid))
    }

    /// Accept a nested relationship with the nested VID identified by
    /// `nested_receiver`, minting a fresh nested VID of our own under
    /// `parent_sender`. `thread_id` must echo the nested request.
    pub fn make_nested_relationship_accept(
        &self,
        parent_sender: &str,
        nested_receiver: &str,
        thread_id: Digest,
    ) -> Result<((Url, Vec<u8>), OwnedVid), Error> {
        let nested_vid = self.make_propositioning_vid(parent_sender)?;
        self.set_relation_and_state_for_vid(
            nested_vid.identifier(),
            RelationshipState::Established {
                thread_id,
                outstanding_nested_threads: vec![],
            },
            nested_receiver,
        )?;
        self.set_relation_and_state_for_vid(
            nested_receiver,
            RelationshipState::Established {
                thread_id,
                outstanding_nested_threads: vec![],
            },
            nested_vid.identifier(),
        )?;

        let receiver_vid = self.get_vid(nested_receiver)?;
        let parent_receiver = receiver_vid
            .get_parent_vid()
            .ok_or(Error::Relationship(format!(
                "missing parent for {nested_receiver}"
            )))?;

        let inner_message = crate::crypto::sign(&nested_vid, Some(&*receiver_vid.vid), &[])?;

        let (transport, message) = self.seal_message_payload(
            parent_sender,
            parent_receiver,
            None,
            Payload::AcceptNestedRelationship {
                thread_id,
                inner: &inner_message,
            },
        )?;

        Ok(((transport, message), nested_vid))
    }

    fn make_propositioning_vid(&self, parent_vid: &str) -> Result<OwnedVid, Error> {
        let transport = Url::parse("tsp://").map_err(VidError::from)?;

        let vid = OwnedVid::new_did_peer(transport);
        self.add_private_vid(vid.clone(), None, None)?;
        self.set_parent_for_vid(vid.identifier(), Some(parent_vid))?;

        Ok(vid)
    }

    /// Send a message given a route, extracting and verifying the next hop
    fn resolve_route_and_send(
        &self,
        hop_list: &[&str],
        opaque_message: &[u8],
    ) -> Result<(Url, Vec<u8>), Error> {
        let (next_hop, path) = self.resolve_route(hop_list)?;

        self.forward_routed_message(&next_hop, path, opaque_message)
    }

    fn add_nested_vid(&self, vid: &str) -> Result<(), Error> {
        let nested_vid = verify_vid_offline(vid)?;

        self.add_verified_vid(nested_vid, None, None)
    }

    fn upgrade_relation(&self, my_vid: &str, other_vid: &str, thread_id: Digest) -> Result<(), Error> {
        let mut vids = self.vids.write()?;
        let Some(context) = vids.get_mut(other_vid) else {
            return Err(Error::Relationship(format!("unknown other vid {other_vid}")));
        };

        context.relation_state = transition(
            &context.relation_state,
            RelationshipEvent::ReceiveAccept { thread_id },
        )?;
        context.relation_vid = Some(my_vid.to_string());

        Ok(())
    }

    fn add_nested_thread_id(&self, vid: &str, thread_id: Digest) -> Result<(), Error> {
        self.modify_vid(vid, |context| {
            let RelationshipState::Established {
                ref mut outstanding_nested_threads,
                ..
            } = context.relation_state
            else {
                return Err(Error::Relationship(format!(
                    "no established relationship with {vid}"
                )));
            };

            outstanding_nested_threads.push(thread_id);

            Ok(())
        })
    }

    fn add_nested_relation(
        &self,
        parent_vid: &str,
        nested_vid: &str,
        thread_id: Digest,
    ) -> Result<(), Error> {
        let mut vids = self.vids.write()?;
        let Some(context) = vids.get_mut(parent_vid) else {
            return Err(Error::Relationship(format!(
                "unknown parent vid {parent_vid}"
            )));
        };

        let RelationshipState::Established {
            ref mut outstanding_nested_threads,
            ..
        } = context.relation_state
        else {
            return Err(Error::Relationship(format!(
                "no relationship set for parent vid {parent_vid}"
            )));
        };

        // the affirm must close a nested thread we actually opened
        let Some(index) = outstanding_nested_threads
            .iter()
            .position(|&x| x == thread_id)
        else {
            return Err(Error::Relationship(format!(
                "cannot find thread_id for nested vid {nested_vid}"
            )));
        };
        outstanding_nested_threads.remove(index);

        let Some(context) = vids.get_mut(nested_vid) else {
            return Err(Error::Relationship(format!(
                "unknown nested vid {nested_vid}"
            )));
        };

        context.relation_state = RelationshipState::Established {
            thread_id,
            outstanding_nested_threads: vec![],
        };

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        OwnedVid,
        definitions::{Payload, ReceivedMessage},
        relationship::RelationshipState,
    };

    fn new_vid() -> OwnedVid {
        OwnedVid::new_did_peer("tcp://127.0.0.1:1337".parse().unwrap())
    }

    #[test]
    fn test_add_private_vid() {
        let store = Store::new();
        let vid = new_vid();

        store.add_private_vid(vid.clone(), None, None).unwrap();

        assert!(store.has_private_vid(vid.identifier()).unwrap());

        // re-adding the exact same identity is idempotent
        store.add_private_vid(vid.clone(), None, None).unwrap();
    }

    #[test]
    fn test_add_private_vid_conflict() {
        let store = Store::new();
        let vid = new_vid();

        // same identifier, different key material
        let mut impostor = new_vid();
        impostor.vid.id = vid.identifier().to_string();

        store.add_private_vid(vid.clone(), None, None).unwrap();

        assert!(matches!(
            store.add_private_vid(impostor, None, None),
            Err(Error::DuplicateIdentifier(_))
        ));
    }

    #[test]
    fn test_add_verified_vid() {
        let store = Store::new();
        let owned_vid = new_vid();

        store
            .add_verified_vid(owned_vid.vid().clone(), None, None)
            .unwrap();

        assert!(store.get_verified_vid(owned_vid.identifier()).is_ok());
    }

    #[test]
    fn test_add_verified_vid_never_drops_private_keys() {
        let store = Store::new();
        let vid = new_vid();

        store.add_private_vid(vid.clone(), None, None).unwrap();

        assert!(matches!(
            store.add_verified_vid(vid.vid().clone(), None, None),
            Err(Error::DuplicateIdentifier(_))
        ));
        assert!(store.has_private_vid(vid.identifier()).unwrap());
    }

    #[test]
    fn test_remove() {
        let store = Store::new();
        let vid = new_vid();

        store.add_private_vid(vid.clone(), None, None).unwrap();

        assert!(store.has_private_vid(vid.identifier()).unwrap());

        store.forget_vid(vid.identifier()).unwrap();

        assert!(!store.has_private_vid(vid.identifier()).unwrap());
        assert!(matches!(
            store.forget_vid(vid.identifier()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_aliases() {
        let store = Store::new();
        let vid = new_vid();

        store.add_private_vid(vid.clone(), None, None).unwrap();
        store
            .set_alias("me".to_string(), vid.identifier().to_string())
            .unwrap();

        assert_eq!(
            store.resolve_alias("me").unwrap().as_deref(),
            Some(vid.identifier())
        );
        // an unknown alias resolves to itself
        assert_eq!(store.try_resolve_alias("you").unwrap(), "you");
        // resolution is stable
        assert_eq!(
            store.try_resolve_alias("me").unwrap(),
            store.try_resolve_alias("me").unwrap()
        );
    }

    #[test]
    fn test_register_with_alias() {
        let store = Store::new();
        let vid = new_vid();
        let other = new_vid();

        store
            .add_private_vid(vid.clone(), Some("me".to_string()), None)
            .unwrap();
        store
            .add_verified_owned_vid(&other, Some("them".to_string()), None)
            .unwrap();

        assert_eq!(
            store.resolve_alias("me").unwrap().as_deref(),
            Some(vid.identifier())
        );
        assert_eq!(
            store.resolve_alias("them").unwrap().as_deref(),
            Some(other.identifier())
        );

        // operations resolve the alias like any other
        store.forget_vid("them").unwrap();
        assert!(!store.has_verified_vid(other.identifier()).unwrap());
    }

    #[test]
    fn test_kv() {
        let store = Store::new();

        store.store_kv("config", b"value".to_vec()).unwrap();
        assert_eq!(store.get_kv("config").unwrap(), b"value");

        assert!(matches!(store.get_kv("absent"), Err(Error::NotFound(_))));

        store.remove_kv("config").unwrap();
        assert!(matches!(store.get_kv("config"), Err(Error::NotFound(_))));
        store.remove_kv("config").unwrap();
    }

    #[test]
    fn test_open_seal() {
        let store = Store::new();
        let alice = new_vid();
        let bob = new_vid();

        store.add_private_vid(alice.clone(), None, None).unwrap();
        store.add_private_vid(bob.clone(), None, None).unwrap();

        let message = b"hello world";

        let (url, mut sealed) = store
            .seal_message(alice.identifier(), bob.identifier(), None, message)
            .unwrap();

        assert_eq!(url.as_str(), "tcp://127.0.0.1:1337");

        let received = store.open_message(&mut sealed).unwrap();

        if let ReceivedMessage::GenericMessage {
            sender,
            message: received_message,
            message_type,
            ..
        } = received
        {
            assert_eq!(sender, alice.identifier());
            assert_eq!(received_message, message);
            assert_eq!(message_type.crypto_type, wire::CryptoType::Authcrypt);
            assert_eq!(message_type.signature_type, wire::SignatureType::Ed25519);
        } else {
            panic!("unexpected message type");
        }
    }

    #[test]
    fn test_seal_to_unknown_recipient() {
        let store = Store::new();
        let alice = new_vid();
        let bob = new_vid();

        store.add_private_vid(alice.clone(), None, None).unwrap();

        assert!(matches!(
            store.seal_message(alice.identifier(), bob.identifier(), None, b"hi"),
            Err(Error::UnknownRecipient(_))
        ));
    }

    #[test]
    fn test_open_from_unverified_source() {
        let alice_store = Store::new();
        let bob_store = Store::new();
        let alice = new_vid();
        let bob = new_vid();

        alice_store.add_private_vid(alice.clone(), None, None).unwrap();
        alice_store.add_verified_vid(bob.vid().clone(), None, None).unwrap();
        bob_store.add_private_vid(bob.clone(), None, None).unwrap();
        // bob never verified alice

        let (_, mut sealed) = alice_store
            .seal_message(alice.identifier(), bob.identifier(), None, b"hi")
            .unwrap();

        match bob_store.open_message(&mut sealed) {
            Err(Error::UnverifiedSource(vid, _)) => assert_eq!(vid, alice.identifier()),
            other => panic!("expected UnverifiedSource, got {other:?}"),
        }
    }

    #[test]
    fn test_sign_anycast() {
        let store = Store::new();
        let alice = new_vid();

        store.add_private_vid(alice.clone(), None, None).unwrap();

        let mut signed = store.sign_anycast(alice.identifier(), b"broadcast").unwrap();

        let received = store.open_message(&mut signed).unwrap();
        let ReceivedMessage::GenericMessage {
            sender,
            receiver,
            message,
            message_type,
            ..
        } = received
        else {
            panic!("unexpected message type");
        };

        assert_eq!(sender, alice.identifier());
        assert_eq!(receiver, None);
        assert_eq!(message, b"broadcast");
        assert_eq!(message_type.crypto_type, wire::CryptoType::Plaintext);
    }

    #[test]
    fn test_make_relationship_request() {
        let store = Store::new();
        let alice = new_vid();
        let bob = new_vid();

        store.add_private_vid(alice.clone(), None, None).unwrap();
        store.add_private_vid(bob.clone(), None, None).unwrap();

        let (url, mut sealed) = store
            .make_relationship_request(alice.identifier(), bob.identifier(), None)
            .unwrap();

        assert_eq!(url.as_str(), "tcp://127.0.0.1:1337");

        let received = store.open_message(&mut sealed).unwrap();

        if let ReceivedMessage::RequestRelationship { sender, .. } = received {
            assert_eq!(sender, alice.identifier());
        } else {
            panic!("unexpected message type");
        }

        assert!(matches!(
            store
                .relation_state_for_vid_pair(alice.identifier(), bob.identifier())
                .unwrap(),
            RelationshipState::Requested { .. }
        ));
    }

    #[test]
    fn test_make_relationship_accept() {
        let store = Store::new();
        let alice = new_vid();
        let bob = new_vid();

        store.add_private_vid(alice.clone(), None, None).unwrap();
        store.add_private_vid(bob.clone(), None, None).unwrap();

        // alice wants to establish a relation
        let (_, mut sealed) = store
            .make_relationship_request(alice.identifier(), bob.identifier(), None)
            .unwrap();

        let ReceivedMessage::RequestRelationship {
            sender, thread_id, ..
        } = store.open_message(&mut sealed).unwrap()
        else {
            panic!("unexpected message type");
        };
        assert_eq!(sender, alice.identifier());

        // bob accepts the relation
        let (_, mut sealed) = store
            .make_relationship_accept(bob.identifier(), alice.identifier(), thread_id, None)
            .unwrap();

        let ReceivedMessage::AcceptRelationship { sender, .. } =
            store.open_message(&mut sealed).unwrap()
        else {
            panic!("unexpected message type");
        };
        assert_eq!(sender, bob.identifier());

        // both directions converge on the same established thread
        let state = store
            .relation_state_for_vid_pair(alice.identifier(), bob.identifier())
            .unwrap();
        assert!(matches!(state, RelationshipState::Established { .. }));
        assert_eq!(state.thread_id(), Some(thread_id));

        let state = store
            .relation_state_for_vid_pair(bob.identifier(), alice.identifier())
            .unwrap();
        assert_eq!(state.thread_id(), Some(thread_id));
    }

    #[test]
    fn test_accept_with_wrong_thread_id() {
        let store = Store::new();
        let alice = new_vid();
        let bob = new_vid();

        store.add_private_vid(alice.clone(), None, None).unwrap();
        store.add_private_vid(bob.clone(), None, None).unwrap();

        let (_, mut sealed) = store
            .make_relationship_request(alice.identifier(), bob.identifier(), None)
            .unwrap();
        let _ = store.open_message(&mut sealed).unwrap();

        // an accept that doesn't echo the request's thread id is rejected
        let mut forged = crate::crypto::seal(
            &bob,
            alice.vid(),
            None,
            Payload::AcceptRelationship {
                thread_id: [0xaa; 32],
            },
        )
        .unwrap();

        assert!(matches!(
            store.open_message(&mut forged),
            Err(Error::Relationship(_))
        ));
    }

    #[test]
    fn test_relationship_accept_resolves_aliases() {
        let store = Store::new();
        let alice = new_vid();
        let bob = new_vid();

        store.add_private_vid(alice.clone(), None, None).unwrap();
        store.add_private_vid(bob.clone(), None, None).unwrap();
        store
            .set_alias("alice".to_string(), alice.identifier().to_string())
            .unwrap();
        store
            .set_alias("bob".to_string(), bob.identifier().to_string())
            .unwrap();

        let (_, mut sealed) = store
            .make_relationship_request("alice", "bob", None)
            .unwrap();
        let ReceivedMessage::RequestRelationship { thread_id, .. } =
            store.open_message(&mut sealed).unwrap()
        else {
            panic!("unexpected message type");
        };

        store
            .make_relationship_accept("bob", "alice", thread_id, None)
            .unwrap();

        let (vids, _aliases, _kv) = store.export().unwrap();
        let alice_entry = vids
            .iter()
            .find(|entry| entry.vid.identifier() == alice.identifier())
            .expect("missing alice entry");
        assert_eq!(alice_entry.relation_vid.as_deref(), Some(bob.identifier()));
        assert!(matches!(
            alice_entry.relation_state,
            RelationshipState::Established { .. }
        ));
    }

    #[test]
    fn test_make_relationship_cancel() {
        let store = Store::new();
        let alice = new_vid();
        let bob = new_vid();

        store.add_private_vid(alice.clone(), None, None).unwrap();
        store.add_private_vid(bob.clone(), None, None).unwrap();

        let (_, mut sealed) = store
            .make_relationship_request(alice.identifier(), bob.identifier(), None)
            .unwrap();
        let ReceivedMessage::RequestRelationship { thread_id, .. } =
            store.open_message(&mut sealed).unwrap()
        else {
            panic!("unexpected message type");
        };

        let (_, mut sealed) = store
            .make_relationship_accept(bob.identifier(), alice.identifier(), thread_id, None)
            .unwrap();
        let _ = store.open_message(&mut sealed).unwrap();

        // now bob cancels the relation
        let (_, mut sealed) = store
            .make_relationship_cancel(bob.identifier(), alice.identifier())
            .unwrap();

        let ReceivedMessage::CancelRelationship { sender, .. } =
            store.open_message(&mut sealed).unwrap()
        else {
            panic!("unexpected message type");
        };
        assert_eq!(sender, bob.identifier());

        // the pair is terminal now: no new handshake can start
        assert!(matches!(
            store.make_relationship_request(alice.identifier(), bob.identifier(), None),
            Err(Error::Relationship(_))
        ));
        assert!(matches!(
            store.make_relationship_cancel(bob.identifier(), alice.identifier()),
            Err(Error::Relationship(_))
        ));
    }

    #[test]
    fn test_cancel_with_wrong_thread_id() {
        let store = Store::new();
        let alice = new_vid();
        let bob = new_vid();

        store.add_private_vid(alice.clone(), None, None).unwrap();
        store.add_private_vid(bob.clone(), None, None).unwrap();

        let (_, mut sealed) = store
            .make_relationship_request(alice.identifier(), bob.identifier(), None)
            .unwrap();
        let ReceivedMessage::RequestRelationship { thread_id, .. } =
            store.open_message(&mut sealed).unwrap()
        else {
            panic!("unexpected message type");
        };
        let (_, mut sealed) = store
            .make_relationship_accept(bob.identifier(), alice.identifier(), thread_id, None)
            .unwrap();
        let _ = store.open_message(&mut sealed).unwrap();

        // a cancel with the wrong thread id must not end the relationship
        let mut forged = crate::crypto::seal(
            &bob,
            alice.vid(),
            None,
            Payload::CancelRelationship {
                thread_id: [0xbb; 32],
            },
        )
        .unwrap();

        assert!(matches!(
            store.open_message(&mut forged),
            Err(Error::Relationship(_))
        ));
        assert!(matches!(
            store
                .relation_state_for_vid_pair(alice.identifier(), bob.identifier())
                .unwrap(),
            RelationshipState::Established { .. }
        ));
    }

    #[test]
    fn test_invalid_routes() {
        let store = Store::new();
        let alice = new_vid();
        let bob = new_vid();

        store.add_private_vid(alice.clone(), None, None).unwrap();
        store.add_verified_vid(bob.vid().clone(), None, None).unwrap();

        // a single-hop route is invalid
        assert!(matches!(
            store.set_route_for_vid(bob.identifier(), [alice.identifier()]),
            Err(Error::MalformedRoute(_))
        ));

        // forwarding towards an unknown hop fails
        assert!(matches!(
            store.forward_routed_message("did:test:unknown", vec![b"hop".as_ref()], b"payload"),
            Err(Error::UnknownRecipient(_))
        ));
    }

    #[test]
    fn test_routed() {
        let a_store = Store::new();
        let b_store = Store::new();
        let c_store = Store::new();
        let d_store = Store::new();

        let nette_a = new_vid();
        let sneaky_a = new_vid();

        let b = new_vid();

        let mailbox_c = new_vid();
        let c = new_vid();

        let sneaky_d = new_vid();
        let nette_d = new_vid();

        a_store.add_private_vid(nette_a.clone(), None, None).unwrap();
        a_store.add_private_vid(sneaky_a.clone(), None, None).unwrap();
        b_store.add_private_vid(b.clone(), None, None).unwrap();
        c_store.add_private_vid(mailbox_c.clone(), None, None).unwrap();
        c_store.add_private_vid(c.clone(), None, None).unwrap();
        d_store.add_private_vid(sneaky_d.clone(), None, None).unwrap();
        d_store.add_private_vid(nette_d.clone(), None, None).unwrap();

        a_store.add_verified_vid(b.vid().clone(), None, None).unwrap();
        a_store
            .add_verified_vid(sneaky_d.vid().clone(), None, None)
            .unwrap();

        b_store
            .add_verified_vid(nette_a.vid().clone(), None, None)
            .unwrap();
        b_store.add_verified_vid(c.vid().clone(), None, None).unwrap();

        c_store.add_verified_vid(b.vid().clone(), None, None).unwrap();
        c_store
            .add_verified_vid(nette_d.vid().clone(), None, None)
            .unwrap();

        d_store
            .add_verified_vid(sneaky_a.vid().clone(), None, None)
            .unwrap();
        d_store
            .add_verified_vid(mailbox_c.vid().clone(), None, None)
            .unwrap();

        a_store
            .set_relation_for_vid(b.identifier(), nette_a.identifier())
            .unwrap();
        a_store
            .set_relation_for_vid(sneaky_d.identifier(), sneaky_a.identifier())
            .unwrap();
        a_store
            .set_route_for_vid(
                sneaky_d.identifier(),
                [b.identifier(), c.identifier(), mailbox_c.identifier()],
            )
            .unwrap();

        b_store
            .set_relation_for_vid(c.identifier(), b.identifier())
            .unwrap();

        c_store
            .set_relation_for_vid(mailbox_c.identifier(), nette_d.identifier())
            .unwrap();

        let hello_world = b"hello world";

        let (_url, mut sealed) = a_store
            .seal_message(
                sneaky_a.identifier(),
                sneaky_d.identifier(),
                None,
                hello_world,
            )
            .unwrap();

        // the first hop only learns the next hop, not the final receiver
        let received = b_store.open_message(&mut sealed).unwrap();

        let ReceivedMessage::ForwardRequest {
            sender,
            receiver,
            next_hop,
            route,
            opaque_payload,
        } = received
        else {
            panic!()
        };
        assert_eq!(sender, nette_a.identifier());
        assert_eq!(receiver, b.identifier());
        assert_eq!(next_hop, c.identifier());

        let (_url, mut sealed) = b_store
            .forward_routed_message(
                &next_hop,
                route.iter().map(|s| s.as_ref()).collect(),
                &opaque_payload,
            )
            .unwrap();

        let received = c_store.open_message(&mut sealed).unwrap();

        let ReceivedMessage::ForwardRequest {
            sender,
            receiver,
            next_hop,
            route,
            opaque_payload,
        } = received
        else {
            panic!()
        };
        assert_eq!(sender, b.identifier());
        assert_eq!(receiver, c.identifier());
        assert_eq!(next_hop, mailbox_c.identifier());
        assert!(route.is_empty());

        let (_url, mut sealed) = c_store
            .forward_routed_message(
                &next_hop,
                route.iter().map(|s| s.as_ref()).collect(),
                &opaque_payload,
            )
            .unwrap();

        let received = d_store.open_message(&mut sealed).unwrap();

        let ReceivedMessage::GenericMessage {
            sender,
            receiver,
            nonconfidential_data,
            message,
            message_type,
        } = received
        else {
            panic!()
        };

        assert_eq!(sender, sneaky_a.identifier());
        assert_eq!(receiver.unwrap(), sneaky_d.identifier());
        assert!(nonconfidential_data.is_none());
        assert_eq!(message, hello_world);
        assert_eq!(message_type.crypto_type, wire::CryptoType::Authcrypt);
        assert_eq!(message_type.signature_type, wire::SignatureType::Ed25519);
    }

    #[test]
    fn test_nested_manual() {
        let a_store = Store::new();
        let b_store = Store::new();

        let a = new_vid();
        let b = new_vid();

        let nested_a = new_vid();
        let nested_b = new_vid();

        a_store.add_private_vid(a.clone(), None, None).unwrap();
        a_store.add_private_vid(nested_a.clone(), None, None).unwrap();

        b_store.add_private_vid(b.clone(), None, None).unwrap();
        b_store.add_private_vid(nested_b.clone(), None, None).unwrap();

        a_store.add_verified_vid(b.vid().clone(), None, None).unwrap();
        a_store
            .add_verified_vid(nested_b.vid().clone(), None, None)
            .unwrap();

        b_store.add_verified_vid(a.vid().clone(), None, None).unwrap();
        b_store
            .add_verified_vid(nested_a.vid().clone(), None, None)
            .unwrap();

        a_store
            .set_parent_for_vid(nested_b.identifier(), Some(b.identifier()))
            .unwrap();
        a_store
            .set_relation_for_vid(nested_b.identifier(), nested_a.identifier())
            .unwrap();
        a_store
            .set_parent_for_vid(nested_a.identifier(), Some(a.identifier()))
            .unwrap();

        b_store
            .set_parent_for_vid(nested_a.identifier(), Some(a.identifier()))
            .unwrap();

        let hello_world = b"hello world";

        let (_url, mut sealed) = a_store
            .seal_message(
                nested_a.identifier(),
                nested_b.identifier(),
                None,
                hello_world,
            )
            .unwrap();

        // the outer envelope only names the parent VIDs
        let probe = wire::probe(&sealed).unwrap();
        let EnvelopeType::EncryptedMessage {
            sender: outer_sender,
            receiver: outer_receiver,
        } = probe
        else {
            panic!()
        };
        assert_eq!(outer_sender, a.identifier().as_bytes());
        assert_eq!(outer_receiver, b.identifier().as_bytes());

        let received = b_store.open_message(&mut sealed).unwrap();

        let ReceivedMessage::GenericMessage {
            sender,
            receiver,
            nonconfidential_data,
            message,
            message_type,
        } = received
        else {
            panic!()
        };

        assert_eq!(sender, nested_a.identifier());
        assert_eq!(receiver.unwrap(), nested_b.identifier());
        assert!(nonconfidential_data.is_none());
        assert_eq!(message, hello_world);
        // upgraded: the outer envelope from the parent was encrypted
        assert_eq!(message_type.crypto_type, wire::CryptoType::Authcrypt);
    }

    #[test]
    fn test_nested_automatic_setup() {
        let a_store = Store::new();
        let b_store = Store::new();

        let a = new_vid();
        let b = new_vid();

        a_store.add_private_vid(a.clone(), None, None).unwrap();
        b_store.add_private_vid(b.clone(), None, None).unwrap();

        a_store.add_verified_vid(b.vid().clone(), None, None).unwrap();
        b_store.add_verified_vid(a.vid().clone(), None, None).unwrap();

        let (_url, mut sealed) = a_store
            .make_relationship_request(a.identifier(), b.identifier(), None)
            .unwrap();

        let ReceivedMessage::RequestRelationship {
            nested_vid: None,
            thread_id,
            ..
        } = b_store.open_message(&mut sealed).unwrap()
        else {
            panic!()
        };

        let (_url, mut sealed) = b_store
            .make_relationship_accept(b.identifier(), a.identifier(), thread_id, None)
            .unwrap();

        let ReceivedMessage::AcceptRelationship { .. } = a_store.open_message(&mut sealed).unwrap()
        else {
            panic!()
        };

        let ((_url, mut sealed), nested_a) = a_store
            .make_nested_relationship_request(a.identifier(), b.identifier())
            .unwrap();

        let ReceivedMessage::RequestRelationship {
            nested_vid: Some(ref nested_vid_1),
            thread_id,
            ..
        } = b_store.open_message(&mut sealed).unwrap()
        else {
            panic!()
        };

        let ((_url, mut sealed), nested_b) = b_store
            .make_nested_relationship_accept(b.identifier(), nested_vid_1, thread_id)
            .unwrap();

        let ReceivedMessage::AcceptRelationship {
            nested_vid: Some(ref nested_vid_2),
            ..
        } = a_store.open_message(&mut sealed).unwrap()
        else {
            panic!()
        };

        assert_eq!(nested_a.identifier(), nested_vid_1);
        assert_eq!(nested_b.identifier(), nested_vid_2);

        assert_eq!(
            a_store
                .get_vid(nested_a.identifier())
                .unwrap()
                .get_parent_vid(),
            Some(a.identifier())
        );
        assert_eq!(
            b_store
                .get_vid(nested_b.identifier())
                .unwrap()
                .get_parent_vid(),
            Some(b.identifier())
        );
        assert_eq!(
            b_store.get_vid(nested_vid_1).unwrap().get_parent_vid(),
            Some(a.identifier())
        );
        assert_eq!(
            a_store.get_vid(nested_vid_2).unwrap().get_parent_vid(),
            Some(b.identifier())
        );

        let hello_world = b"hello world";

        let (_url, mut sealed) = a_store
            .seal_message(
                nested_a.identifier(),
                nested_b.identifier(),
                None,
                hello_world,
            )
            .unwrap();

        let received = b_store.open_message(&mut sealed).unwrap();

        let ReceivedMessage::GenericMessage {
            sender,
            receiver,
            message,
            ..
        } = received
        else {
            panic!()
        };

        assert_eq!(sender, nested_a.identifier());
        assert_eq!(receiver.unwrap(), nested_b.identifier());
        assert_eq!(message, hello_world);
    }
}
