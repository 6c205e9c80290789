use base64ct::{Base64UrlUnpadded, Encoding};
use serde_json::json;
use url::Url;

use crate::{
    definitions::VerifiedVid,
    vid::{Vid, error::VidError},
};

pub(crate) const SCHEME: &str = "peer";

/// Encode a VID as a did:peer (numalgo 2), embedding the verification and
/// encryption keys and a service definition of type `tsp`.
/// See <https://identity.foundation/peer-did-method-spec/>
pub fn encode_did_peer(vid: &Vid) -> String {
    let mut v = Vec::with_capacity(34);
    // multicodec for ed25519-pub, followed by the key length
    v.push(0xed);
    v.push(0x20);
    v.extend_from_slice(vid.verifying_key().as_ref());

    let verification_key = bs58::encode(&v)
        .with_alphabet(bs58::Alphabet::BITCOIN)
        .into_string();

    v.clear();
    // multicodec for x25519-pub, followed by the key length
    v.push(0xec);
    v.push(0x20);
    v.extend_from_slice(vid.encryption_key().as_ref());

    let encryption_key = bs58::encode(&v)
        .with_alphabet(bs58::Alphabet::BITCOIN)
        .into_string();

    let service = Base64UrlUnpadded::encode_string(
        json!({
            "t": "tsp",
            "s": {
                "uri": vid.endpoint()
            }
        })
        .to_string()
        .as_bytes(),
    );

    format!("did:peer:2.Vz{verification_key}.Ez{encryption_key}.S{service}")
}

pub fn verify_did_peer(parts: &[&str]) -> Result<Vid, VidError> {
    let Some(encoded) = parts.get(2) else {
        return Err(VidError::InvalidVid(parts.join(":")));
    };
    let mut peer_parts = encoded.split('.');

    // only numalgo 2 is supported
    if peer_parts.next() != Some("2") {
        return Err(VidError::ResolveVid(
            "only numalgo 2 is supported for did:peer",
        ));
    }

    let mut public_sigkey = None;
    let mut public_enckey = None;
    let mut transport = None;

    let mut buf = [0; 34];

    for part in peer_parts {
        let Some(prefix) = part.get(0..2) else {
            return Err(VidError::ResolveVid("invalid part in did:peer"));
        };
        match prefix {
            // key agreement (encryption) key, base58 multibase
            "Ez" => {
                let len = bs58::decode(&part[2..])
                    .with_alphabet(bs58::Alphabet::BITCOIN)
                    .onto(&mut buf)
                    .map_err(|_| {
                        VidError::ResolveVid("invalid encoded encryption key in did:peer")
                    })?;
                if len != buf.len() {
                    return Err(VidError::ResolveVid(
                        "invalid encryption key length in did:peer",
                    ));
                }

                match buf {
                    // multicodec for x25519-pub + length 32 bytes
                    [0xec, 0x20, rest @ ..] => public_enckey = Some(rest),
                    _ => {
                        return Err(VidError::ResolveVid(
                            "invalid encryption key type in did:peer",
                        ));
                    }
                }
            }
            // authentication (verification) key, base58 multibase
            "Vz" => {
                let len = bs58::decode(&part[2..])
                    .with_alphabet(bs58::Alphabet::BITCOIN)
                    .onto(&mut buf)
                    .map_err(|_| {
                        VidError::ResolveVid("invalid encoded verification key in did:peer")
                    })?;
                if len != buf.len() {
                    return Err(VidError::ResolveVid(
                        "invalid verification key length in did:peer",
                    ));
                }

                match buf {
                    // multicodec for ed25519-pub + length 32 bytes
                    [0xed, 0x20, rest @ ..] => public_sigkey = Some(rest),
                    _ => {
                        return Err(VidError::ResolveVid(
                            "invalid signature key type in did:peer",
                        ));
                    }
                }
            }
            // base64url encoded service definition
            "Se" => {
                let transport_bytes = Base64UrlUnpadded::decode_vec(&part[1..])
                    .map_err(|_| VidError::ResolveVid("invalid encoded transport in did:peer"))?;

                let transport_json: serde_json::Value = serde_json::from_slice(&transport_bytes)
                    .map_err(|_| VidError::ResolveVid("invalid encoded transport in did:peer"))?;

                if transport_json["t"] != "tsp" {
                    return Err(VidError::ResolveVid("invalid transport type in did:peer"));
                }

                if let Some(uri) = transport_json["s"]["uri"].as_str() {
                    transport = Url::parse(uri).ok();
                }
            }
            _ => {
                return Err(VidError::ResolveVid("invalid part in did:peer"));
            }
        }
    }

    match (public_sigkey, public_enckey, transport) {
        (Some(public_sigkey), Some(public_enckey), Some(transport)) => Ok(Vid {
            id: parts.join(":"),
            transport,
            public_sigkey: public_sigkey.into(),
            public_enckey: public_enckey.into(),
        }),
        (None, _, _) => Err(VidError::ResolveVid("missing verification key in did:peer")),
        (_, None, _) => Err(VidError::ResolveVid("missing encryption key in did:peer")),
        (_, _, None) => Err(VidError::ResolveVid("missing transport in did:peer")),
    }
}
