//! Verified identifiers (VIDs) and the key material behind them. A [`Vid`]
//! holds the public half needed to address and verify a remote party; an
//! [`OwnedVid`] adds the private keys of an identity we control.

use core::fmt;
use serde::{Deserialize, Serialize};
use serde_with::{
    base64::{Base64, UrlSafe},
    formats::Unpadded,
    serde_as,
};
use url::Url;

use crate::definitions::{
    PrivateKeyData, PrivateSigningKeyData, PrivateVid, PublicKeyData, PublicVerificationKeyData,
    VerifiedVid,
};

pub mod did;
pub mod error;
mod resolve;

pub use error::VidError;
#[cfg(feature = "resolve")]
pub use resolve::verify_vid;
pub use resolve::verify_vid_offline;

/// A verified identifier: everything needed to send to and authenticate a
/// remote party, but no secrets.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vid {
    pub(crate) id: String,
    pub(crate) transport: Url,
    #[serde_as(as = "Base64<UrlSafe, Unpadded>")]
    pub(crate) public_sigkey: PublicVerificationKeyData,
    #[serde_as(as = "Base64<UrlSafe, Unpadded>")]
    pub(crate) public_enckey: PublicKeyData,
}

/// An identity we control: a [`Vid`] plus its private keys.
#[serde_as]
#[derive(Clone, Serialize, Deserialize)]
pub struct OwnedVid {
    #[serde(flatten)]
    pub(crate) vid: Vid,
    #[serde_as(as = "Base64<UrlSafe, Unpadded>")]
    pub(crate) sigkey: PrivateSigningKeyData,
    #[serde_as(as = "Base64<UrlSafe, Unpadded>")]
    pub(crate) enckey: PrivateKeyData,
}

impl fmt::Debug for OwnedVid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedVid")
            .field("vid", &self.vid)
            .field("sigkey", &"[redacted]")
            .field("enckey", &"[redacted]")
            .finish()
    }
}

impl Vid {
    /// Reconstruct a [`Vid`] from any verified VID implementation.
    pub(crate) fn from_verified_vid(vid: &dyn VerifiedVid) -> Vid {
        Vid {
            id: vid.identifier().to_string(),
            transport: vid.endpoint().clone(),
            public_sigkey: vid.verifying_key().clone(),
            public_enckey: vid.encryption_key().clone(),
        }
    }
}

impl OwnedVid {
    /// Generate fresh key material bound to the given identifier and
    /// transport endpoint.
    pub fn bind(id: impl Into<String>, transport: Url) -> Self {
        let (sigkey, public_sigkey) = crate::crypto::gen_sign_keypair();
        let (enckey, public_enckey) = crate::crypto::gen_encrypt_keypair();

        OwnedVid {
            vid: Vid {
                id: id.into(),
                transport,
                public_sigkey,
                public_enckey,
            },
            sigkey,
            enckey,
        }
    }

    /// Mint a fresh identity whose identifier is a self-certifying did:peer.
    pub fn new_did_peer(transport: Url) -> OwnedVid {
        let mut vid = OwnedVid::bind("", transport);
        vid.vid.id = did::peer::encode_did_peer(&vid.vid);

        vid
    }

    pub(crate) fn from_private_vid(vid: &dyn PrivateVid) -> OwnedVid {
        OwnedVid {
            vid: Vid::from_verified_vid(vid),
            sigkey: vid.signing_key().clone(),
            enckey: vid.decryption_key().clone(),
        }
    }

    /// Load a private identity from a JSON file on disk.
    #[cfg(feature = "async")]
    pub async fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, VidError> {
        let vid_data = tokio::fs::read_to_string(path)
            .await
            .map_err(|_| VidError::ResolveVid("private VID file not found"))?;

        serde_json::from_str(&vid_data)
            .map_err(|_| VidError::ResolveVid("private VID contains invalid JSON"))
    }

    pub fn vid(&self) -> &Vid {
        &self.vid
    }

    pub fn into_vid(self) -> Vid {
        self.vid
    }
}

impl VerifiedVid for Vid {
    fn identifier(&self) -> &str {
        self.id.as_ref()
    }

    fn endpoint(&self) -> &Url {
        &self.transport
    }

    fn verifying_key(&self) -> &PublicVerificationKeyData {
        &self.public_sigkey
    }

    fn encryption_key(&self) -> &PublicKeyData {
        &self.public_enckey
    }
}

impl VerifiedVid for OwnedVid {
    fn identifier(&self) -> &str {
        self.vid.identifier()
    }

    fn endpoint(&self) -> &Url {
        self.vid.endpoint()
    }

    fn verifying_key(&self) -> &PublicVerificationKeyData {
        self.vid.verifying_key()
    }

    fn encryption_key(&self) -> &PublicKeyData {
        self.vid.encryption_key()
    }
}

impl PrivateVid for OwnedVid {
    fn decryption_key(&self) -> &PrivateKeyData {
        &self.enckey
    }

    fn signing_key(&self) -> &PrivateSigningKeyData {
        &self.sigkey
    }
}
