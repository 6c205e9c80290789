pub mod peer;
pub mod web;

pub(crate) const SCHEME: &str = "did";
