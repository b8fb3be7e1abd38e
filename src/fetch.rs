use crate::config::ProxyConfig;
use crate::source::signature_expiry;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use mime::Mime;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

/// One client identity to present to the origin.
#[derive(Debug, Clone, Copy)]
pub struct FetchProfile {
    pub label: &'static str,
    pub headers: &'static [(&'static str, &'static str)],
}

/// Profiles tried in order until one succeeds. Some signed-URL origins answer
/// differently depending on referrer and user agent, so the sequence moves
/// from a full browser identity down to no headers at all.
pub const FETCH_PROFILES: &[FetchProfile] = &[
    FetchProfile {
        label: "browser",
        headers: &[
            (
                "User-Agent",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
            ),
            ("Accept", "image/avif,image/webp,image/apng,image/*,*/*;q=0.8"),
            ("Accept-Language", "en-US,en;q=0.9"),
            ("Referer", "https://www.notion.so/"),
            ("Sec-Fetch-Dest", "image"),
            ("Sec-Fetch-Mode", "no-cors"),
            ("Sec-Fetch-Site", "cross-site"),
        ],
    },
    FetchProfile {
        label: "browser-alt",
        headers: &[
            (
                "User-Agent",
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
            ),
            ("Accept", "image/webp,image/png,image/*;q=0.8,*/*;q=0.5"),
        ],
    },
    FetchProfile {
        label: "http-client",
        headers: &[
            ("User-Agent", concat!("image-proxy/", env!("CARGO_PKG_VERSION"))),
            ("Accept", "*/*"),
        ],
    },
    FetchProfile { label: "bare", headers: &[] },
];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AttemptError {
    #[error("upstream status {0}")]
    Status(u16),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("not an image: {0}")]
    NotImage(String),
    #[error("input exceeds {0} byte limit")]
    TooLarge(usize),
    #[error("network error: {0}")]
    Network(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("all {} fetch profiles failed", .0.len())]
    Exhausted(Vec<(&'static str, AttemptError)>),
}

#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub bytes: Bytes,
    /// Declared `Content-Type`, empty when the origin sent none.
    pub content_type: String,
    /// Label of the profile that succeeded.
    pub profile: &'static str,
}

/// Source of upstream image bytes.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedImage, FetchError>;
}

pub struct RetryFetcher {
    client: Client,
    profiles: Vec<FetchProfile>,
    attempt_timeout: Duration,
    max_input_size: usize,
}

impl RetryFetcher {
    pub fn new(config: &ProxyConfig) -> Result<Self, reqwest::Error> {
        Self::with_profiles(config, FETCH_PROFILES.to_vec())
    }

    pub fn with_profiles(config: &ProxyConfig, profiles: Vec<FetchProfile>) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(config.attempt_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self {
            client,
            profiles,
            attempt_timeout: config.attempt_timeout,
            max_input_size: config.max_input_size,
        })
    }

    /// Logs when a signed URL already looks expired. Advisory only: clock skew
    /// or a misread parameter must not stop the fetch.
    fn warn_if_expired(url: &str) {
        let Ok(parsed) = url::Url::parse(url) else { return };
        if let Some(expiry) = signature_expiry(&parsed) {
            let now = time::OffsetDateTime::now_utc();
            if expiry < now {
                tracing::warn!(
                    "Signed URL appears expired ({}s ago), fetching anyway: {}",
                    (now - expiry).whole_seconds(),
                    url
                );
            }
        }
    }

    /// Performs a single request with one profile's headers.
    ///
    /// Validation order:
    /// 1. HTTP status must be 2xx
    /// 2. Content-Type must be `image/*` or `application/octet-stream` when
    ///    parseable; a missing type passes and is sniffed later
    /// 3. Content-Length must not exceed `max_input_size`
    /// 4. The streamed body is cut off as soon as it passes the limit
    ///
    /// # Security
    /// The streaming check holds even when Content-Length is absent or lies,
    /// so a hostile origin cannot make the proxy buffer more than the limit.
    ///
    /// # Errors
    /// One [`AttemptError`] describing why this profile failed.
    async fn attempt(&self, url: &str, profile: &FetchProfile) -> Result<FetchedImage, AttemptError> {
        let mut request = self.client.get(url);
        for (name, value) in profile.headers {
            request = request.header(*name, *value);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| AttemptError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(AttemptError::Status(resp.status().as_u16()));
        }

        let ct = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        // Unparseable or missing types pass; the pipeline sniffs the bytes.
        if let Ok(m) = ct.parse::<Mime>() {
            if m.type_() != mime::IMAGE && m.essence_str() != "application/octet-stream" {
                return Err(AttemptError::NotImage(ct));
            }
        }

        if let Some(len) = resp.content_length() {
            if len as usize > self.max_input_size {
                return Err(AttemptError::TooLarge(self.max_input_size));
            }
        }

        let mut buf = BytesMut::with_capacity(8192);
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream
            .next()
            .await
            .transpose()
            .map_err(|e| AttemptError::Network(e.to_string()))?
        {
            if buf.len() + chunk.len() > self.max_input_size {
                return Err(AttemptError::TooLarge(self.max_input_size));
            }
            buf.extend_from_slice(&chunk);
        }

        Ok(FetchedImage { bytes: buf.freeze(), content_type: ct, profile: profile.label })
    }
}

#[async_trait]
impl SourceFetcher for RetryFetcher {
    /// Tries each profile once, in order, each under its own timeout.
    ///
    /// The first success wins. An expired-looking signature only logs a
    /// warning before the first attempt.
    ///
    /// # Errors
    /// `FetchError::Exhausted` carrying every profile's failure, in the order
    /// they were tried. Callers treat this as recoverable.
    async fn fetch(&self, url: &str) -> Result<FetchedImage, FetchError> {
        Self::warn_if_expired(url);

        let mut failures = Vec::with_capacity(self.profiles.len());
        for profile in &self.profiles {
            let outcome = tokio::time::timeout(self.attempt_timeout, self.attempt(url, profile))
                .await
                .unwrap_or(Err(AttemptError::Timeout(self.attempt_timeout)));

            match outcome {
                Ok(image) => {
                    tracing::info!(
                        "Fetched {} bytes via profile={} after {} failed attempts",
                        image.bytes.len(),
                        profile.label,
                        failures.len()
                    );
                    return Ok(image);
                }
                Err(e) => {
                    tracing::warn!("Fetch attempt profile={} failed for {}: {}", profile.label, url, e);
                    failures.push((profile.label, e));
                }
            }
        }

        tracing::error!("All {} fetch profiles failed for {}", failures.len(), url);
        Err(FetchError::Exhausted(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_degrade_to_bare() {
        let labels: Vec<_> = FETCH_PROFILES.iter().map(|p| p.label).collect();
        assert_eq!(labels, ["browser", "browser-alt", "http-client", "bare"]);
        assert!(FETCH_PROFILES.last().unwrap().headers.is_empty());
        assert!(FETCH_PROFILES[0].headers.iter().any(|(k, _)| *k == "Referer"));
    }

    #[test]
    fn exhausted_error_counts_attempts() {
        let err = FetchError::Exhausted(vec![
            ("browser", AttemptError::Status(403)),
            ("bare", AttemptError::Timeout(Duration::from_secs(1))),
        ]);
        assert_eq!(err.to_string(), "all 2 fetch profiles failed");
    }
}
