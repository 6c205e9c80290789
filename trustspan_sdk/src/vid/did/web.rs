use base64ct::{Base64UrlUnpadded, Encoding};
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use crate::{
    definitions::{PUBLIC_KEY_SIZE, PUBLIC_VERIFICATION_KEY_SIZE, VerifiedVid},
    vid::{OwnedVid, Vid, error::VidError},
};

pub(crate) const SCHEME: &str = "web";

const PROTOCOL: &str = "https://";
const DEFAULT_PATH: &str = ".well-known";
const DOCUMENT: &str = "did.json";

#[allow(dead_code)]
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    #[serde(rename = "@context")]
    pub context: Vec<String>,
    pub authentication: Vec<String>,
    pub id: String,
    pub key_agreement: Vec<String>,
    pub service: Vec<Service>,
    pub verification_method: Vec<VerificationMethod>,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    pub service_endpoint: Url,
    #[serde(rename = "type")]
    pub service_type: String,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMethod {
    pub controller: String,
    pub id: String,
    pub public_key_jwk: PublicKeyJwk,
    #[serde(rename = "type")]
    pub method_type: String,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyJwk {
    pub crv: Curve,
    pub kty: String,
    #[serde(rename = "use")]
    pub usage: Usage,
    pub x: String,
}

#[derive(Copy, Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub enum Curve {
    X25519,
    Ed25519,
}

#[derive(Copy, Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum Usage {
    Sig,
    Enc,
}

/// Fetch the DID document over HTTPS and validate it against the queried id.
#[cfg(feature = "resolve")]
pub async fn resolve(id: &str, parts: &[&str]) -> Result<Vid, VidError> {
    let url = resolve_url(parts)?;

    let response = reqwest::get(url.as_ref())
        .await
        .map_err(|e| VidError::Http(url.to_string(), e))?;

    let did_document = match response.error_for_status() {
        Ok(r) => r
            .json::<DidDocument>()
            .await
            .map_err(|e| VidError::Json(url.to_string(), e))?,
        Err(e) => Err(VidError::Http(url.to_string(), e))?,
    };

    resolve_document(did_document, id)
}

/// The URL a did:web identifier dereferences to, per the did:web method spec.
pub fn resolve_url(parts: &[&str]) -> Result<Url, VidError> {
    match parts {
        ["did", "web", domain] => format!(
            "{PROTOCOL}{}/{DEFAULT_PATH}/{DOCUMENT}",
            domain.replace("%3A", ":")
        ),
        ["did", "web", domain, path @ ..] => {
            format!(
                "{PROTOCOL}{}/{}/{DOCUMENT}",
                domain.replace("%3A", ":"),
                path.join("/")
            )
        }
        _ => return Err(VidError::InvalidVid(parts.join(":"))),
    }
    .parse()
    .map_err(|_| VidError::InvalidVid(parts.join(":")))
}

fn find_first_key<const N: usize>(
    did_document: &DidDocument,
    method: &[String],
    curve: Curve,
    usage: Usage,
) -> Option<[u8; N]> {
    method
        .iter()
        .next()
        .and_then(|id| {
            did_document
                .verification_method
                .iter()
                .find(|item| &item.id == id)
        })
        .and_then(|method| {
            if method.public_key_jwk.crv == curve && method.public_key_jwk.usage == usage {
                Base64UrlUnpadded::decode_vec(&method.public_key_jwk.x).ok()
            } else {
                None
            }
        })
        .and_then(|key| <[u8; N]>::try_from(key).ok())
}

/// Extract a verified VID from a DID document, checking that the document
/// actually describes the identifier it was fetched for.
pub fn resolve_document(did_document: DidDocument, target_id: &str) -> Result<Vid, VidError> {
    if did_document.id != target_id {
        return Err(VidError::Verification(format!(
            "DID document is for '{}', not '{target_id}'",
            did_document.id
        )));
    }

    let Some(public_sigkey) = find_first_key::<PUBLIC_VERIFICATION_KEY_SIZE>(
        &did_document,
        &did_document.authentication,
        Curve::Ed25519,
        Usage::Sig,
    ) else {
        return Err(VidError::Verification(
            "no valid verification key found in DID document".to_string(),
        ));
    };

    let Some(public_enckey) = find_first_key::<PUBLIC_KEY_SIZE>(
        &did_document,
        &did_document.key_agreement,
        Curve::X25519,
        Usage::Enc,
    ) else {
        return Err(VidError::Verification(
            "no valid encryption key found in DID document".to_string(),
        ));
    };

    let transport = match did_document.service.into_iter().next().and_then(|service| {
        if service.service_type == "TSPTransport" {
            Some(service)
        } else {
            None
        }
    }) {
        Some(service) => service.service_endpoint,
        None => {
            return Err(VidError::Verification(
                "no transport found in the DID document".to_string(),
            ));
        }
    };

    Ok(Vid {
        id: did_document.id,
        transport,
        public_sigkey: public_sigkey.into(),
        public_enckey: public_enckey.into(),
    })
}

/// Render a DID document that publishes this VID's public keys and endpoint.
pub fn vid_to_did_document(vid: &impl VerifiedVid) -> serde_json::Value {
    let id = vid.identifier();

    json!({
        "@context": [
            "https://www.w3.org/ns/did/v1",
            "https://w3id.org/security/suites/jws-2020/v1"
        ],
        "id": id,
        "verificationMethod": [
            {
                "id": format!("{id}#verification-key"),
                "type": "JsonWebKey2020",
                "controller": format!("{id}"),
                "publicKeyJwk": {
                    "kty": "OKP",
                    "crv": "Ed25519",
                    "use": "sig",
                    "x": Base64UrlUnpadded::encode_string(vid.verifying_key().as_ref()),
                }
            },
            {
                "id": format!("{id}#encryption-key"),
                "type": "JsonWebKey2020",
                "controller": format!("{id}"),
                "publicKeyJwk": {
                    "kty": "OKP",
                    "crv": "X25519",
                    "use": "enc",
                    "x": Base64UrlUnpadded::encode_string(vid.encryption_key().as_ref()),
                }
            },
        ],
        "authentication": [
            format!("{id}#verification-key"),
        ],
        "keyAgreement": [
            format!("{id}#encryption-key"),
        ],
        "service": [{
            "id": "#tsp-transport",
            "type": "TSPTransport",
            "serviceEndpoint": vid.endpoint()
        }]
    })
}

/// Mint a fresh did:web identity under `domain`, returning the DID document
/// to publish, the private document to keep, and the private VID itself.
pub fn create_did_web(
    name: &str,
    domain: &str,
    transport: &str,
) -> Result<(serde_json::Value, serde_json::Value, OwnedVid), VidError> {
    let did = format!("did:web:{}:endpoint:{name}", domain.replace(":", "%3A"));
    let private_vid = OwnedVid::bind(did, Url::parse(transport)?);
    let private_doc = serde_json::to_value(&private_vid)
        .map_err(|_| VidError::Verification("could not serialize VID".to_string()))?;
    let did_doc = vid_to_did_document(private_vid.vid());

    Ok((did_doc, private_doc, private_vid))
}
