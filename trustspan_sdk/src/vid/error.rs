#[derive(thiserror::Error, Debug)]
pub enum VidError {
    #[cfg(feature = "resolve")]
    #[error("fetching '{0}' failed: {1}")]
    Http(String, #[source] reqwest::Error),
    #[cfg(feature = "resolve")]
    #[error("deserializing document from '{0}' failed: {1}")]
    Json(String, #[source] reqwest::Error),
    #[error("'{0}' is not a valid VID")]
    InvalidVid(String),
    #[error("could not resolve VID: {0}")]
    ResolveVid(&'static str),
    #[error("document did not validate: {0}")]
    Verification(String),
    #[error(transparent)]
    Url(#[from] url::ParseError),
}
