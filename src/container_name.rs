//! Container name synthesis and parsing.
//!
//! Names look like `api_<api_name>_<40-hex-char sha1>`, mirroring the
//! original's `api_<api_name>_<hash>` scheme so a container's logical API
//! can be recovered purely from its Docker name during a registry refresh.
use std::sync::atomic::{AtomicU64, Ordering};

use sha1::{Digest, Sha1};

static NEXT_CONTAINER_ID: AtomicU64 = AtomicU64::new(1);

const SEP: char = '_';

/// Prefix shared by every container belonging to `api_name`, used both
/// to build a new name and to filter the driver's container listing.
pub fn name_prefix(api_name: &str) -> String {
    format!("api{SEP}{api_name}{SEP}")
}

/// Synthesize a fresh, collision-resistant container name for `api_name`.
pub fn unique_name(api_name: &str, now_nanos: u128) -> String {
    let id = NEXT_CONTAINER_ID.fetch_add(1, Ordering::Relaxed);
    let seed = format!("{id}{SEP}{now_nanos}");
    let digest = Sha1::digest(seed.as_bytes());
    format!("{}{}", name_prefix(api_name), hex::encode(digest))
}

/// Recover the `api_name` a container name was synthesized for, or
/// `None` if `name` doesn't match the `api_<name>_<40-hex>` shape.
pub fn api_name_from_container_name(name: &str) -> Option<String> {
    let parts: Vec<&str> = name.split(SEP).collect();
    let hash = parts.last()?;
    let looks_like_sha1 = hash.len() == 40 && hash.chars().all(|c| c.is_ascii_hexdigit());
    if parts.len() >= 3 && parts[0] == "api" && looks_like_sha1 {
        Some(parts[1..parts.len() - 1].join(&SEP.to_string()))
    } else {
        None
    }
}
