use crate::resolution::ResolutionDescriptor;
use crate::source;
use sha2::{Digest, Sha256};
use std::fmt;

/// Identity of one transformed variant: the signature-free source URL plus the
/// requested resolution. Used both by the cache store and the coalescer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    source: String,
    resolution: ResolutionDescriptor,
}

impl CacheKey {
    /// Normalizes `url` (see [`source::normalize`]) and pairs it with `resolution`.
    pub fn new(url: &str, resolution: ResolutionDescriptor) -> Self {
        Self { source: source::normalize(url), resolution }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn resolution(&self) -> ResolutionDescriptor {
        self.resolution
    }

    /// Quoted strong validator derived from the key alone, so it can be
    /// answered before the variant has ever been produced.
    pub fn etag(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_string().as_bytes());
        let digest = hasher.finalize();
        format!("\"{}\"", hex::encode(&digest[..16]))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.source, self.resolution)
    }
}
