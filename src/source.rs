//! Source URL classification and cache-key normalization.
//!
//! Object storage hands out signed, time-limited URLs: the same object is
//! reachable through many URLs that differ only in their signing parameters.
//! [`normalize`] strips those parameters so every signature of one object maps
//! onto one cache key.

use thiserror::Error;
use time::macros::format_description;
use time::{Duration, OffsetDateTime, PrimitiveDateTime};
use url::Url;

/// Query parameters that vary per signature but not per object. Compared
/// case-insensitively.
const SIGNING_PARAMS: &[&str] = &[
    "x-amz-algorithm",
    "x-amz-credential",
    "x-amz-date",
    "x-amz-expires",
    "x-amz-security-token",
    "x-amz-signature",
    "x-amz-signedheaders",
    "awsaccesskeyid",
    "expires",
    "signature",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("not a valid absolute URL: {0}")]
    Malformed(String),
    #[error("unsupported scheme: {0}")]
    Scheme(String),
    #[error("host is not an allowed origin: {0}")]
    Disallowed(String),
}

fn is_signing_param(name: &str) -> bool {
    SIGNING_PARAMS.iter().any(|p| p.eq_ignore_ascii_case(name))
}

/// Returns true when `host` equals an allowlist entry or is a subdomain of one.
pub fn host_allowed(host: &str, allowed_hosts: &[String]) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    allowed_hosts.iter().any(|entry| {
        let entry = entry.to_ascii_lowercase();
        host == entry || host.ends_with(&format!(".{}", entry))
    })
}

/// Parses `raw` and checks it against the trusted origin allowlist.
pub fn classify(raw: &str, allowed_hosts: &[String]) -> Result<Url, SourceError> {
    let url = Url::parse(raw).map_err(|_| SourceError::Malformed(raw.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SourceError::Scheme(url.scheme().to_string()));
    }
    let host = url
        .host_str()
        .ok_or_else(|| SourceError::Malformed(raw.to_string()))?;
    if !host_allowed(host, allowed_hosts) {
        return Err(SourceError::Disallowed(host.to_string()));
    }
    Ok(url)
}

pub fn is_eligible(raw: &str, allowed_hosts: &[String]) -> bool {
    classify(raw, allowed_hosts).is_ok()
}

/// Removes per-signature query parameters, keeping the ones that identify the
/// object. A URL with no signing parameters (or one that does not parse) is
/// returned unchanged.
pub fn normalize(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if !pairs.iter().any(|(k, _)| is_signing_param(k)) {
        return raw.to_string();
    }

    let kept: Vec<_> = pairs.into_iter().filter(|(k, _)| !is_signing_param(k)).collect();
    url.set_query(None);
    url.set_fragment(None);
    if !kept.is_empty() {
        url.query_pairs_mut().extend_pairs(kept);
    }
    url.into()
}

/// Best-effort expiry instant of a signed URL.
///
/// Understands SigV4 (`X-Amz-Date` + `X-Amz-Expires`) and the legacy
/// `Expires=<unix seconds>` form. Returns `None` when neither is present or
/// parseable.
pub fn signature_expiry(url: &Url) -> Option<OffsetDateTime> {
    let mut amz_date = None;
    let mut amz_expires = None;
    let mut legacy_expires = None;
    for (k, v) in url.query_pairs() {
        if k.eq_ignore_ascii_case("x-amz-date") {
            amz_date = Some(v.into_owned());
        } else if k.eq_ignore_ascii_case("x-amz-expires") {
            amz_expires = v.parse::<i64>().ok();
        } else if k.eq_ignore_ascii_case("expires") {
            legacy_expires = v.parse::<i64>().ok();
        }
    }

    if let (Some(date), Some(secs)) = (amz_date, amz_expires) {
        let fmt = format_description!("[year][month][day]T[hour][minute][second]Z");
        if let Ok(issued) = PrimitiveDateTime::parse(&date, &fmt) {
            // Out-of-range windows leave the expiry unknown.
            return issued.assume_utc().checked_add(Duration::seconds(secs));
        }
    }
    legacy_expires.and_then(|epoch| OffsetDateTime::from_unix_timestamp(epoch).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;

    const OBJECT: &str =
        "https://prod-files-secure.s3.us-west-2.amazonaws.com/space/block/photo.jpg";

    fn signed(signature: &str, date: &str) -> String {
        format!(
            "{OBJECT}?X-Amz-Algorithm=AWS4-HMAC-SHA256&X-Amz-Credential=AKIA%2F20240101%2Fus-west-2%2Fs3%2Faws4_request\
             &X-Amz-Date={date}&X-Amz-Expires=3600&X-Amz-Signature={signature}&X-Amz-SignedHeaders=host&x-id=GetObject"
        )
    }

    #[test]
    fn signatures_collapse_to_one_key() {
        let a = normalize(&signed("aaaa", "20240101T000000Z"));
        let b = normalize(&signed("bbbb", "20240202T120000Z"));
        assert_eq!(a, b);
        assert_eq!(a, format!("{OBJECT}?x-id=GetObject"));
    }

    #[test]
    fn unsigned_url_is_unchanged() {
        let raw = "https://www.notion.so/image/foo.png?table=block&id=abc";
        assert_eq!(normalize(raw), raw);
    }

    #[test]
    fn all_params_stripped_leaves_no_query() {
        let raw = format!("{OBJECT}?Signature=xyz&Expires=1700000000&AWSAccessKeyId=AKIA");
        assert_eq!(normalize(&raw), OBJECT);
    }

    #[test]
    fn allowlist_accepts_subdomains_only() {
        let allowed = ProxyConfig::default().allowed_hosts;
        assert!(is_eligible("https://www.notion.so/image/x.png", &allowed));
        assert!(is_eligible(OBJECT, &allowed));
        assert!(!is_eligible("https://evilnotion.so/x.png", &allowed));
        assert!(!is_eligible("https://example.com/x.png", &allowed));
        assert!(!is_eligible("ftp://notion.so/x.png", &allowed));
        assert!(!is_eligible("not a url", &allowed));
    }

    #[test]
    fn classify_reports_reason() {
        let allowed = vec!["notion.so".to_string()];
        assert_eq!(
            classify("https://example.com/a.png", &allowed),
            Err(SourceError::Disallowed("example.com".into()))
        );
        assert!(matches!(classify("/relative.png", &allowed), Err(SourceError::Malformed(_))));
    }

    #[test]
    fn sigv4_expiry_is_issue_time_plus_window() {
        let url = Url::parse(&signed("s", "20240101T000000Z")).unwrap();
        let expiry = signature_expiry(&url).unwrap();
        assert_eq!(expiry.unix_timestamp(), 1_704_067_200 + 3600);
    }

    #[test]
    fn absurd_expiry_window_is_unknown() {
        for window in ["9223372036854775807", "-9223372036854775808"] {
            let url = Url::parse(&format!(
                "{OBJECT}?X-Amz-Date=20240101T000000Z&X-Amz-Expires={window}&X-Amz-Signature=x"
            ))
            .unwrap();
            assert!(signature_expiry(&url).is_none());
        }
    }

    #[test]
    fn legacy_expiry_and_missing_expiry() {
        let url = Url::parse(&format!("{OBJECT}?Expires=1700000000&Signature=x")).unwrap();
        assert_eq!(signature_expiry(&url).unwrap().unix_timestamp(), 1_700_000_000);
        assert!(signature_expiry(&Url::parse(OBJECT).unwrap()).is_none());
    }
}
