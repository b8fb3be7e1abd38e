/// HTTP caching directives attached to image responses.
///
/// Successful variants are content-addressed by their cache key, so they are
/// served as immutable for 30 days. Placeholders get a short lifetime so that
/// browsers and edges retry soon instead of pinning a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachePolicy {
    /// Browser cache time-to-live in seconds (`max-age`).
    pub max_age: u32,
    /// Shared-cache time-to-live in seconds (`s-maxage`); omitted when `None`.
    pub shared_max_age: Option<u32>,
    pub immutable: bool,
}

pub const THIRTY_DAYS: u32 = 30 * 24 * 60 * 60;
pub const FIVE_MINUTES: u32 = 5 * 60;

impl CachePolicy {
    pub const fn immutable() -> Self {
        Self { max_age: THIRTY_DAYS, shared_max_age: Some(THIRTY_DAYS), immutable: true }
    }

    pub const fn short_lived() -> Self {
        Self { max_age: FIVE_MINUTES, shared_max_age: None, immutable: false }
    }

    /// `Cache-Control` header value. Responses are always `public`.
    pub fn header_value(&self) -> String {
        let mut parts = vec!["public".to_string(), format!("max-age={}", self.max_age)];
        if let Some(seconds) = self.shared_max_age {
            parts.push(format!("s-maxage={}", seconds));
        }
        if self.immutable {
            parts.push("immutable".to_string());
        }
        parts.join(", ")
    }
}
