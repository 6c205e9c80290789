use std::collections::{HashMap, HashSet};

use aries_askar::{ErrorKind, Session, StoreKeyMethod, entry::EntryOperation};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    Error, ExportVid, OwnedVid, Vid,
    relationship::RelationshipState,
    store::{Aliases, KvEntries, WalletExport},
};

/// A wallet: encrypted storage for identifiers, key material, relationship
/// state and application data. An [`AsyncStore`](crate::AsyncStore) reads the
/// wallet before every operation and persists it afterwards.
#[async_trait]
pub trait WalletStorage: Sized {
    /// Provision a new wallet
    async fn new(url: &str, password: &[u8]) -> Result<Self, Error>;

    /// Open an existing wallet
    async fn open(url: &str, password: &[u8]) -> Result<Self, Error>;

    /// Write a snapshot from memory to the wallet
    async fn persist(&self, snapshot: WalletExport) -> Result<(), Error>;

    /// Read a snapshot from the wallet into memory
    async fn read(&self) -> Result<WalletExport, Error>;

    /// Close the wallet
    async fn close(self) -> Result<(), Error>;

    /// Destroy the wallet
    async fn destroy(self) -> Result<(), Error>;
}

/// A [`WalletStorage`] backed by an Aries Askar store (SQLite by default),
/// encrypted with a raw key derived from the wallet password.
pub struct AskarWallet {
    inner: aries_askar::Store,
    url: String,
}

/// Everything about a VID except its key material; the keys live in separate
/// `key` entries so Askar treats them as secrets.
#[derive(Debug, Serialize, Deserialize)]
struct VidRecord {
    id: String,
    transport: String,
    relation_state: RelationshipState,
    relation_vid: Option<String>,
    parent_vid: Option<String>,
    tunnel: Option<Box<[String]>>,
    metadata: Option<serde_json::Value>,
}

/// Insert an entry, replacing any previous value under the same name.
async fn upsert(
    conn: &mut Session,
    category: &str,
    name: &str,
    value: &[u8],
) -> Result<(), Error> {
    match conn.insert(category, name, value, None, None).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::Duplicate => {
            conn.update(EntryOperation::Replace, category, name, Some(value), None, None)
                .await?;

            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn fetch_key(conn: &mut Session, name: &str) -> Result<Option<Vec<u8>>, Error> {
    Ok(conn.fetch("key", name, false).await?.map(|e| e.value.to_vec()))
}

/// Remove an entry, succeeding if it was already gone.
async fn remove_entry(conn: &mut Session, category: &str, name: &str) -> Result<(), Error> {
    match conn.remove(category, name).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl WalletStorage for AskarWallet {
    async fn new(url: &str, password: &[u8]) -> Result<Self, Error> {
        let pass_key = aries_askar::Store::new_raw_key(Some(password))?;

        let inner =
            aries_askar::Store::provision(url, StoreKeyMethod::RawKey, pass_key, None, true)
                .await?;

        Ok(Self {
            inner,
            url: url.to_string(),
        })
    }

    async fn open(url: &str, password: &[u8]) -> Result<Self, Error> {
        let pass_key = aries_askar::Store::new_raw_key(Some(password))?;

        let inner =
            aries_askar::Store::open(url, Some(StoreKeyMethod::RawKey), pass_key, None).await?;

        Ok(Self {
            inner,
            url: url.to_string(),
        })
    }

    async fn persist(&self, (vids, aliases, kv): WalletExport) -> Result<(), Error> {
        let mut conn = self.inner.session(None).await?;

        // drop stored records (and their key material) that the snapshot no
        // longer contains, so a forgotten VID stays forgotten
        let keep: HashSet<&str> = vids.iter().map(|export| export.vid.id.as_str()).collect();
        let stored = conn
            .fetch_all(Some("vid"), None, None, None, false, false)
            .await?;
        for item in stored.iter() {
            if keep.contains(item.name.as_str()) {
                continue;
            }

            remove_entry(&mut conn, "vid", &item.name).await?;
            for key in [
                "verification-key",
                "encryption-key",
                "signing-key",
                "decryption-key",
            ] {
                remove_entry(&mut conn, "key", &format!("{}#{key}", item.name)).await?;
            }
        }

        for export in vids {
            let id = export.vid.id.clone();

            upsert(
                &mut conn,
                "key",
                &format!("{id}#verification-key"),
                export.vid.public_sigkey.as_ref(),
            )
            .await?;
            upsert(
                &mut conn,
                "key",
                &format!("{id}#encryption-key"),
                export.vid.public_enckey.as_ref(),
            )
            .await?;

            if let Some(ref private) = export.private {
                upsert(
                    &mut conn,
                    "key",
                    &format!("{id}#signing-key"),
                    private.sigkey.as_ref(),
                )
                .await?;
                upsert(
                    &mut conn,
                    "key",
                    &format!("{id}#decryption-key"),
                    private.enckey.as_ref(),
                )
                .await?;
            }

            let record = serde_json::to_string(&VidRecord {
                id: id.clone(),
                transport: export.vid.transport.to_string(),
                relation_state: export.relation_state,
                relation_vid: export.relation_vid,
                parent_vid: export.parent_vid,
                tunnel: export.tunnel,
                metadata: export.metadata,
            })
            .map_err(|_| Error::DecodeState("could not encode vid record"))?;

            upsert(&mut conn, "vid", &id, record.as_bytes()).await?;
        }

        let aliases = serde_json::to_vec(&aliases)
            .map_err(|_| Error::DecodeState("could not encode aliases"))?;
        upsert(&mut conn, "extra_data", "aliases", &aliases).await?;

        let kv =
            serde_json::to_vec(&kv).map_err(|_| Error::DecodeState("could not encode kv data"))?;
        upsert(&mut conn, "extra_data", "kv", &kv).await?;

        conn.commit().await?;

        Ok(())
    }

    async fn read(&self) -> Result<WalletExport, Error> {
        let mut vids = Vec::new();

        let mut conn = self.inner.session(None).await?;
        let results = conn
            .fetch_all(Some("vid"), None, None, None, false, false)
            .await?;

        for item in results.iter() {
            let record: VidRecord = serde_json::from_slice(&item.value)
                .map_err(|_| Error::DecodeState("could not decode vid record"))?;

            let id = record.id;

            let Some(verification_bytes) = fetch_key(&mut conn, &format!("{id}#verification-key")).await?
            else {
                continue;
            };
            let Some(encryption_bytes) = fetch_key(&mut conn, &format!("{id}#encryption-key")).await?
            else {
                continue;
            };

            let transport: Url = record
                .transport
                .parse()
                .map_err(|_| Error::DecodeState("could not parse transport URL from storage"))?;

            let vid = Vid {
                id,
                transport,
                public_sigkey: verification_bytes
                    .try_into()
                    .map_err(Error::DecodeState)?,
                public_enckey: encryption_bytes.try_into().map_err(Error::DecodeState)?,
            };

            let signing_key = fetch_key(&mut conn, &format!("{}#signing-key", vid.id)).await?;
            let decryption_key = fetch_key(&mut conn, &format!("{}#decryption-key", vid.id)).await?;

            let private = match (signing_key, decryption_key) {
                (Some(signing_key), Some(decryption_key)) => Some(OwnedVid {
                    vid: vid.clone(),
                    sigkey: signing_key.try_into().map_err(Error::DecodeState)?,
                    enckey: decryption_key.try_into().map_err(Error::DecodeState)?,
                }),
                _ => None,
            };

            vids.push(ExportVid {
                vid,
                private,
                relation_state: record.relation_state,
                relation_vid: record.relation_vid,
                parent_vid: record.parent_vid,
                tunnel: record.tunnel,
                metadata: record.metadata,
            });
        }

        let aliases: Aliases = match conn.fetch("extra_data", "aliases", false).await? {
            Some(data) => serde_json::from_slice(&data.value)
                .map_err(|_| Error::DecodeState("could not decode aliases from storage"))?,
            None => HashMap::new(),
        };

        let kv: KvEntries = match conn.fetch("extra_data", "kv", false).await? {
            Some(data) => serde_json::from_slice(&data.value)
                .map_err(|_| Error::DecodeState("could not decode kv data from storage"))?,
            None => HashMap::new(),
        };

        conn.commit().await?;

        Ok((vids, aliases, kv))
    }

    async fn close(self) -> Result<(), Error> {
        self.inner.close().await?;

        Ok(())
    }

    async fn destroy(self) -> Result<(), Error> {
        self.inner.close().await?;
        aries_askar::Store::remove(&self.url).await?;

        Ok(())
    }
}
