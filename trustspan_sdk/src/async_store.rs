use bytes::BytesMut;
use url::Url;

use crate::{
    OwnedVid, Store,
    definitions::{Digest, PrivateVid, ReceivedMessage, VerifiedVid},
    error::Error,
    storage::{AskarWallet, WalletStorage},
    store::WalletExport,
};

/// A [`Store`] backed by an encrypted wallet.
///
/// Every operation runs inside a wallet bracket: the wallet contents are read
/// into a fresh in-memory store, the operation runs against it, and the store
/// is persisted back on every exit path, so updates are neither lost nor left
/// only in memory. The bracket is serialized, so concurrent operations on the
/// same [`AsyncStore`] cannot interleave their read-modify-write cycles.
///
/// # Example
///
/// ```no_run
/// use trustspan_sdk::{AsyncStore, OwnedVid};
///
/// #[tokio::main]
/// async fn main() {
///     let store = AsyncStore::new("sqlite://wallet.sqlite", b"password")
///         .await
///         .unwrap();
///
///     let alice_vid = OwnedVid::from_file("alice/identity.json").await.unwrap();
///     store.add_private_vid(alice_vid, None, None).await.unwrap();
/// }
/// ```
pub struct AsyncStore<W: WalletStorage = AskarWallet> {
    wallet: W,
    write_lock: tokio::sync::Mutex<()>,
}

impl AsyncStore<AskarWallet> {
    /// Provision a new wallet at `url`, encrypted with `password`
    pub async fn new(url: &str, password: &[u8]) -> Result<Self, Error> {
        let wallet = AskarWallet::new(url, password).await?;
        tracing::info!("provisioned new wallet at {url}");

        Ok(Self {
            wallet,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Open an existing wallet
    pub async fn open(url: &str, password: &[u8]) -> Result<Self, Error> {
        let wallet = AskarWallet::open(url, password).await?;
        tracing::debug!("opened wallet at {url}");

        Ok(Self {
            wallet,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }
}

impl<W: WalletStorage> AsyncStore<W> {
    /// Wrap an existing wallet implementation
    pub fn from_wallet(wallet: W) -> Self {
        Self {
            wallet,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Close the wallet
    pub async fn close(self) -> Result<(), Error> {
        self.wallet.close().await
    }

    /// Destroy the wallet and its storage
    pub async fn destroy(self) -> Result<(), Error> {
        self.wallet.destroy().await
    }

    /// Run `op` against a store loaded from the wallet, writing the store
    /// back on every exit path. A persist failure after a successful
    /// operation is fatal to it: memory and wallet must not desynchronize.
    async fn with_wallet<T>(
        &self,
        op: impl FnOnce(&Store) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let _guard = self.write_lock.lock().await;

        let store = Store::new();
        store.import(self.wallet.read().await?)?;

        let result = op(&store);

        match self.wallet.persist(store.export()?).await {
            Ok(()) => result,
            // the operation's own error takes precedence
            Err(persist_err) => result.and(Err(persist_err)),
        }
    }

    /// As [`with_wallet`](Self::with_wallet), for operations that do not
    /// modify the store.
    async fn with_wallet_read<T>(
        &self,
        op: impl FnOnce(&Store) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let _guard = self.write_lock.lock().await;

        let store = Store::new();
        store.import(self.wallet.read().await?)?;

        op(&store)
    }

    /// Export the wallet contents to serializable types
    pub async fn export(&self) -> Result<WalletExport, Error> {
        self.with_wallet_read(|store| store.export()).await
    }

    /// Adds `private_vid` to the wallet
    pub async fn add_private_vid(
        &self,
        private_vid: impl PrivateVid + 'static,
        alias: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), Error> {
        self.with_wallet(move |store| store.add_private_vid(private_vid, alias, metadata))
            .await
    }

    /// Add the already resolved `verified_vid` to the wallet
    pub async fn add_verified_vid(
        &self,
        verified_vid: impl VerifiedVid + 'static,
        alias: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), Error> {
        self.with_wallet(move |store| store.add_verified_vid(verified_vid, alias, metadata))
            .await
    }

    /// Resolve and verify the public key material for `did` and add it to the
    /// wallet; returns the transport endpoint the VID listens on.
    pub async fn verify_vid(&self, did: &str, alias: Option<String>) -> Result<Url, Error> {
        // resolution may hit the network, keep it outside the wallet bracket
        let verified_vid = crate::vid::verify_vid(did).await?;
        let endpoint = verified_vid.endpoint().clone();

        tracing::debug!("verified {did}");

        self.with_wallet(move |store| store.add_verified_vid(verified_vid, alias, None))
            .await?;

        Ok(endpoint)
    }

    /// Remove a VID from the wallet
    pub async fn forget_vid(&self, vid: &str) -> Result<(), Error> {
        self.with_wallet(|store| store.forget_vid(vid)).await
    }

    /// List all VIDs in the wallet
    pub async fn list_vids(&self) -> Result<Vec<String>, Error> {
        self.with_wallet_read(|store| store.list_vids()).await
    }

    /// Check whether a private VID exists in the wallet
    pub async fn has_private_vid(&self, vid: &str) -> Result<bool, Error> {
        self.with_wallet_read(|store| store.has_private_vid(vid))
            .await
    }

    /// Check whether a verified VID exists in the wallet
    pub async fn has_verified_vid(&self, vid: &str) -> Result<bool, Error> {
        self.with_wallet_read(|store| store.has_verified_vid(vid))
            .await
    }

    /// Set an alias for a DID
    pub async fn set_alias(&self, alias: String, did: String) -> Result<(), Error> {
        self.with_wallet(|store| store.set_alias(alias, did)).await
    }

    /// Resolve an alias to its corresponding DID
    pub async fn resolve_alias(&self, alias: &str) -> Result<Option<String>, Error> {
        self.with_wallet_read(|store| store.resolve_alias(alias))
            .await
    }

    /// Store an application-defined value under `key`
    pub async fn store_kv(&self, key: impl Into<String>, value: Vec<u8>) -> Result<(), Error> {
        self.with_wallet(|store| store.store_kv(key, value)).await
    }

    /// Retrieve an application-defined value
    pub async fn get_kv(&self, key: &str) -> Result<Vec<u8>, Error> {
        self.with_wallet_read(|store| store.get_kv(key)).await
    }

    /// Remove an application-defined value
    pub async fn remove_kv(&self, key: &str) -> Result<(), Error> {
        self.with_wallet(|store| store.remove_kv(key)).await
    }

    /// Record an out-of-band relationship with `vid`
    pub async fn set_relation_for_vid(&self, vid: &str, relation_vid: &str) -> Result<(), Error> {
        self.with_wallet(|store| store.set_relation_for_vid(vid, relation_vid))
            .await
    }

    /// Adds a route to an already existing VID
    pub async fn set_route_for_vid(&self, vid: &str, route: &[&str]) -> Result<(), Error> {
        self.with_wallet(|store| store.set_route_for_vid(vid, route.iter().copied()))
            .await
    }

    /// Sets the parent for a VID, making it a nested VID
    pub async fn set_parent_for_vid(&self, vid: &str, parent: Option<&str>) -> Result<(), Error> {
        self.with_wallet(|store| store.set_parent_for_vid(vid, parent))
            .await
    }

    /// Seal a message addressed to `receiver`; returns the endpoint to send
    /// the sealed bytes to.
    pub async fn seal_message(
        &self,
        sender: &str,
        receiver: &str,
        nonconfidential_data: Option<&[u8]>,
        message: &[u8],
    ) -> Result<(Url, Vec<u8>), Error> {
        let (endpoint, message) = self
            .with_wallet_read(|store| {
                store.seal_message(sender, receiver, nonconfidential_data, message)
            })
            .await?;

        tracing::info!("sealed message for {receiver}, to be sent to {endpoint}");

        Ok((endpoint, message))
    }

    /// Sign an unencrypted message without a specified recipient
    pub async fn sign_anycast(&self, sender: &str, message: &[u8]) -> Result<Vec<u8>, Error> {
        self.with_wallet_read(|store| store.sign_anycast(sender, message))
            .await
    }

    /// Decode a sealed message addressed to one of our private VIDs. If the
    /// sender is not yet verified, a [`ReceivedMessage::PendingMessage`] is
    /// returned holding the still-sealed payload, so the caller can verify
    /// the VID and retry with [`verify_and_open`](Self::verify_and_open).
    pub async fn open_message(&self, message: &mut [u8]) -> Result<ReceivedMessage, Error> {
        self.with_wallet(|store| {
            let result = store.open_message(message).map(|m| m.into_owned());

            match result {
                Err(Error::UnverifiedSource(unknown_vid, opaque_payload)) => {
                    tracing::debug!("received message from unverified source {unknown_vid}");

                    Ok(ReceivedMessage::PendingMessage {
                        unknown_vid,
                        payload: opaque_payload.unwrap_or_else(|| BytesMut::from(&message[..])),
                    })
                }
                other => other,
            }
        })
        .await
    }

    /// Process the payload of a [`ReceivedMessage::PendingMessage`] by
    /// verifying the unknown VID and opening the payload again.
    pub async fn verify_and_open(
        &self,
        vid: &str,
        mut payload: BytesMut,
    ) -> Result<ReceivedMessage, Error> {
        self.verify_vid(vid, None).await?;

        self.with_wallet(move |store| Ok(store.open_message(&mut payload)?.into_owned()))
            .await
    }

    /// Start a relationship handshake with `receiver`
    pub async fn make_relationship_request(
        &self,
        sender: &str,
        receiver: &str,
        route: Option<&[&str]>,
    ) -> Result<(Url, Vec<u8>), Error> {
        self.with_wallet(|store| store.make_relationship_request(sender, receiver, route))
            .await
    }

    /// Accept a relationship request; `thread_id` must echo the request
    pub async fn make_relationship_accept(
        &self,
        sender: &str,
        receiver: &str,
        thread_id: Digest,
        route: Option<&[&str]>,
    ) -> Result<(Url, Vec<u8>), Error> {
        self.with_wallet(|store| {
            store.make_relationship_accept(sender, receiver, thread_id, route)
        })
        .await
    }

    /// Cancel the relationship with `receiver`
    pub async fn make_relationship_cancel(
        &self,
        sender: &str,
        receiver: &str,
    ) -> Result<(Url, Vec<u8>), Error> {
        self.with_wallet(|store| store.make_relationship_cancel(sender, receiver))
            .await
    }

    /// Start a nested handshake under an established relationship
    pub async fn make_nested_relationship_request(
        &self,
        parent_sender: &str,
        receiver: &str,
    ) -> Result<((Url, Vec<u8>), OwnedVid), Error> {
        self.with_wallet(|store| store.make_nested_relationship_request(parent_sender, receiver))
            .await
    }

    /// Accept a nested relationship request
    pub async fn make_nested_relationship_accept(
        &self,
        parent_sender: &str,
        nested_receiver: &str,
        thread_id: Digest,
    ) -> Result<((Url, Vec<u8>), OwnedVid), Error> {
        self.with_wallet(|store| {
            store.make_nested_relationship_accept(parent_sender, nested_receiver, thread_id)
        })
        .await
    }

    /// Pass along an in-transit routed message that is not meant for us
    pub async fn forward_routed_message(
        &self,
        next_hop: &str,
        route: Vec<impl AsRef<[u8]>>,
        opaque_payload: &[u8],
    ) -> Result<(Url, Vec<u8>), Error> {
        self.with_wallet_read(|store| {
            store.forward_routed_message(
                next_hop,
                route.iter().map(|x| x.as_ref()).collect(),
                opaque_payload,
            )
        })
        .await
    }
}
