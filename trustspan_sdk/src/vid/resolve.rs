use super::{Vid, did, error::VidError};

/// Resolve and verify an identifier into a [`Vid`], dispatching on the DID
/// method. did:web requires a network round trip; did:peer is self-certifying
/// and verified locally.
#[cfg(feature = "resolve")]
pub async fn verify_vid(id: &str) -> Result<Vid, VidError> {
    let parts = id.split(':').collect::<Vec<&str>>();

    match (parts.first(), parts.get(1)) {
        (Some(&did::SCHEME), Some(&did::web::SCHEME)) => did::web::resolve(id, &parts).await,
        (Some(&did::SCHEME), Some(&did::peer::SCHEME)) => did::peer::verify_did_peer(&parts),
        _ => Err(VidError::ResolveVid("unknown VID type")),
    }
}

/// Verify an identifier without touching the network; only self-certifying
/// methods (did:peer) can be verified this way.
pub fn verify_vid_offline(id: &str) -> Result<Vid, VidError> {
    let parts = id.split(':').collect::<Vec<&str>>();

    match (parts.first(), parts.get(1)) {
        (Some(&did::SCHEME), Some(&did::peer::SCHEME)) => did::peer::verify_did_peer(&parts),
        _ => Err(VidError::ResolveVid("VID type cannot be verified offline")),
    }
}
