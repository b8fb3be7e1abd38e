use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use serde::Deserialize;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use subtle::ConstantTimeEq;
use thiserror::Error;
use time::macros::format_description;
use time::OffsetDateTime;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

pub mod cache;
pub mod coalesce;
pub mod config;
pub mod fetch;
pub mod placeholder;
pub mod resolution;
pub mod source;
pub mod transform;

use crate::cache::{CacheEntry, CacheKey, CachePolicy, CacheStats, CacheStore};
use crate::coalesce::Coalescer;
use crate::config::{ConfigError, ProxyConfig};
use crate::fetch::{FetchError, RetryFetcher, SourceFetcher};
use crate::placeholder::{placeholder_bytes, PLACEHOLDER_CONTENT_TYPE};
use crate::resolution::ResolutionDescriptor;
use crate::source::SourceError;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Missing required parameter: url")]
    MissingUrl,
    #[error("Invalid source URL: {0}")]
    InvalidUrl(String),
    #[error("Origin not allowed: {0}")]
    DisallowedOrigin(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

impl From<SourceError> for ProxyError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::Disallowed(host) => ProxyError::DisallowedOrigin(host),
            other => ProxyError::InvalidUrl(other.to_string()),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match self {
            ProxyError::MissingUrl | ProxyError::InvalidUrl(_) | ProxyError::DisallowedOrigin(_) => {
                StatusCode::BAD_REQUEST
            }
            ProxyError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyError::Config(_) | ProxyError::Client(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

pub const CACHE_STATUS_HEADER: HeaderName = HeaderName::from_static("x-cache-status");
pub const ORIGINAL_SIZE_HEADER: HeaderName = HeaderName::from_static("x-original-size");
pub const COMPRESSED_SIZE_HEADER: HeaderName = HeaderName::from_static("x-compressed-size");

/// Value of the `X-Cache-Status` response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    ClientHit,
    ServerHit,
    Miss,
    FetchError,
    Error,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::ClientHit => "CLIENT-HIT",
            CacheStatus::ServerHit => "SERVER-HIT",
            CacheStatus::Miss => "CDN-MISS",
            CacheStatus::FetchError => "FETCH-ERROR",
            CacheStatus::Error => "ERROR",
        }
    }
}

/// Per-process request counters.
#[derive(Debug, Default)]
pub struct Metrics {
    pub client_hits: AtomicU64,
    pub server_hits: AtomicU64,
    pub misses: AtomicU64,
    pub coalesced: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub transform_fallbacks: AtomicU64,
    pub errors: AtomicU64,
}

impl Metrics {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Share of image requests answered without an upstream fetch.
    pub fn hit_rate_percent(&self) -> f64 {
        let hits = self.client_hits.load(Ordering::Relaxed) + self.server_hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total > 0 { hits as f64 / total as f64 * 100.0 } else { 0.0 }
    }

    /// Prometheus text exposition of the counters plus cache gauges.
    pub fn render_prometheus(&self, cache: &CacheStats, in_flight: usize) -> String {
        let counters = [
            ("image_proxy_client_hits_total", "Conditional requests answered with 304", &self.client_hits),
            ("image_proxy_server_hits_total", "Requests served from the in-process cache", &self.server_hits),
            ("image_proxy_misses_total", "Requests that required a fetch", &self.misses),
            ("image_proxy_coalesced_total", "Requests that joined an in-flight fetch", &self.coalesced),
            ("image_proxy_fetch_failures_total", "Requests answered with a placeholder after fetch failure", &self.fetch_failures),
            ("image_proxy_transform_fallbacks_total", "Variants served untransformed after a pipeline failure", &self.transform_fallbacks),
            ("image_proxy_errors_total", "Requests answered with a placeholder after an internal error", &self.errors),
        ];
        let gauges = [
            ("image_proxy_cache_entries", "Entries in the image cache", cache.entry_count as u64),
            ("image_proxy_cache_bytes", "Approximate payload bytes in the image cache", cache.approx_size_bytes),
            ("image_proxy_in_flight", "Fetch operations currently running", in_flight as u64),
        ];

        let mut out = String::new();
        for (name, help, counter) in counters {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n",
                counter.load(Ordering::Relaxed)
            ));
        }
        for (name, help, value) in gauges {
            out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"));
        }
        out
    }
}

/// Outcome of one coalesced fetch + transform.
pub type VariantResult = std::result::Result<Arc<CacheEntry>, FetchError>;

/// Everything the handlers share; built once per process.
pub struct AppState {
    pub config: ProxyConfig,
    pub cache: CacheStore,
    pub coalescer: Coalescer<CacheKey, VariantResult>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: ProxyConfig) -> Result<Self> {
        config.validate()?;
        let fetcher = RetryFetcher::new(&config)?;
        Ok(Self::with_fetcher(config, Arc::new(fetcher)))
    }

    pub fn with_fetcher(config: ProxyConfig, fetcher: Arc<dyn SourceFetcher>) -> Self {
        Self {
            cache: CacheStore::from_config(&config),
            coalescer: Coalescer::new(),
            fetcher,
            metrics: Metrics::default(),
            config,
        }
    }
}

/// Query parameters of the image route
#[derive(Debug, Default, Deserialize)]
pub struct ImageQuery {
    pub url: Option<String>,
    pub size: Option<String>,
    pub w: Option<String>,
    pub h: Option<String>,
    pub q: Option<String>,
}

impl ImageQuery {
    pub fn resolution(&self, max_dimension: u32) -> ResolutionDescriptor {
        ResolutionDescriptor::from_params(
            self.size.as_deref(),
            self.w.as_deref(),
            self.h.as_deref(),
            self.q.as_deref(),
            max_dimension,
        )
    }

    /// Validates the source URL against the allowlist and derives the cache key.
    pub fn resolve(&self, config: &ProxyConfig) -> Result<(String, CacheKey)> {
        let url = self
            .url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or(ProxyError::MissingUrl)?;
        source::classify(url, &config.allowed_hosts)?;
        let key = CacheKey::new(url, self.resolution(config.max_dimension));
        Ok((url.to_string(), key))
    }
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(v) => {
            headers.insert(name, v);
        }
        Err(_) => tracing::warn!("Dropping invalid {} header value: {:?}", name, value),
    }
}

/// IMF-fixdate, as used by `Last-Modified`.
fn http_date(at: SystemTime) -> String {
    let fmt = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    OffsetDateTime::from(at).format(&fmt).unwrap_or_default()
}

/// True when any entity tag listed in `If-None-Match` equals `etag`. Weak
/// validators compare by their opaque tag.
fn etag_matches(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|candidate| candidate.trim().trim_start_matches("W/"))
        .any(|candidate| candidate == etag)
}

fn not_modified(etag: &str) -> Response {
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, header::ETAG, etag);
    insert_header(&mut headers, header::CACHE_CONTROL, &CachePolicy::immutable().header_value());
    insert_header(&mut headers, CACHE_STATUS_HEADER, CacheStatus::ClientHit.as_str());
    (StatusCode::NOT_MODIFIED, headers).into_response()
}

fn image_response(entry: &CacheEntry, etag: &str, status: CacheStatus) -> Response {
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, header::CONTENT_TYPE, &entry.content_type);
    insert_header(&mut headers, header::ETAG, etag);
    insert_header(&mut headers, header::CACHE_CONTROL, &CachePolicy::immutable().header_value());
    insert_header(&mut headers, CACHE_STATUS_HEADER, status.as_str());
    insert_header(&mut headers, header::LAST_MODIFIED, &http_date(entry.stored_at));
    insert_header(&mut headers, ORIGINAL_SIZE_HEADER, &entry.original_size.to_string());
    insert_header(&mut headers, COMPRESSED_SIZE_HEADER, &entry.payload.len().to_string());
    (StatusCode::OK, headers, Body::from(entry.payload.clone())).into_response()
}

/// 200 with the placeholder image and a short lifetime, so browsers and
/// edges come back soon instead of caching the failure.
pub fn placeholder_response(status: CacheStatus) -> Response {
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, header::CONTENT_TYPE, PLACEHOLDER_CONTENT_TYPE);
    insert_header(&mut headers, header::CACHE_CONTROL, &CachePolicy::short_lived().header_value());
    insert_header(&mut headers, CACHE_STATUS_HEADER, status.as_str());
    (StatusCode::OK, headers, Body::from(placeholder_bytes())).into_response()
}

fn panic_response(_panic: Box<dyn Any + Send + 'static>) -> Response {
    tracing::error!("Image handler panicked, serving placeholder");
    placeholder_response(CacheStatus::Error)
}

/// Fetch, transform and store one variant. Runs under the coalescer, so at
/// most one instance per key is active.
async fn produce_variant(state: Arc<AppState>, key: CacheKey, url: String) -> VariantResult {
    let fetched = state.fetcher.fetch(&url).await?;
    let original_size = fetched.bytes.len();
    let profile = fetched.profile;
    let resolution = key.resolution();

    let source_bytes = fetched.bytes.clone();
    let source_type = fetched.content_type.clone();
    let out = match tokio::task::spawn_blocking(move || {
        transform::transform(&fetched.bytes, &fetched.content_type, &resolution)
    })
    .await
    {
        Ok(out) => out,
        Err(e) => {
            tracing::warn!("Transform task for {} aborted, serving original: {}", key, e);
            transform::passthrough(&source_bytes, &source_type)
        }
    };

    if !out.transformed && !resolution.is_original() {
        Metrics::incr(&state.metrics.transform_fallbacks);
    }

    tracing::info!(
        "Stored {} ({} -> {} bytes, {}) via profile={}",
        key,
        original_size,
        out.bytes.len(),
        out.content_type,
        profile
    );
    Ok(state.cache.set(key, out.bytes, out.content_type, original_size))
}

async fn image_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ImageQuery>,
    headers: HeaderMap,
) -> Response {
    tracing::debug!(
        "Processing image request: url={:?}, size={:?}, w={:?}, h={:?}, q={:?}",
        query.url, query.size, query.w, query.h, query.q
    );

    let (url, key) = match query.resolve(&state.config) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Rejected image request: {}", e);
            return e.into_response();
        }
    };

    let etag = state.cache.compute_etag(&key);
    if etag_matches(&headers, &etag) {
        Metrics::incr(&state.metrics.client_hits);
        return not_modified(&etag);
    }

    if let Some(entry) = state.cache.get(&key) {
        tracing::debug!("Cache hit for key={}", key);
        Metrics::incr(&state.metrics.server_hits);
        return image_response(&entry, &etag, CacheStatus::ServerHit);
    }

    Metrics::incr(&state.metrics.misses);

    let op_state = Arc::clone(&state);
    let op_key = key.clone();
    let flight = state
        .coalescer
        .run_exclusive(key.clone(), move || produce_variant(op_state, op_key, url))
        .await;
    if flight.joined {
        Metrics::incr(&state.metrics.coalesced);
    }

    match flight.result {
        Ok(Ok(entry)) => image_response(&entry, &etag, CacheStatus::Miss),
        Ok(Err(e)) => {
            tracing::warn!("Serving placeholder for {}: {}", key, e);
            Metrics::incr(&state.metrics.fetch_failures);
            placeholder_response(CacheStatus::FetchError)
        }
        Err(e) => {
            tracing::error!("Serving placeholder for {}: {}", key, e);
            Metrics::incr(&state.metrics.errors);
            placeholder_response(CacheStatus::Error)
        }
    }
}

// ====================================================================================
// OBSERVABILITY
// ====================================================================================

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "image-proxy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn cache_stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let m = &state.metrics;
    Json(serde_json::json!({
        "cache": state.cache.stats(),
        "in_flight": state.coalescer.in_flight(),
        "requests": {
            "client_hits": m.client_hits.load(Ordering::Relaxed),
            "server_hits": m.server_hits.load(Ordering::Relaxed),
            "misses": m.misses.load(Ordering::Relaxed),
            "coalesced": m.coalesced.load(Ordering::Relaxed),
            "hit_rate_percent": m.hit_rate_percent(),
        },
        "failures": {
            "fetch": m.fetch_failures.load(Ordering::Relaxed),
            "transform_fallbacks": m.transform_fallbacks.load(Ordering::Relaxed),
            "errors": m.errors.load(Ordering::Relaxed),
        }
    }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state
        .metrics
        .render_prometheus(&state.cache.stats(), state.coalescer.in_flight());
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

// ====================================================================================
// ADMINISTRATION
// ====================================================================================

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let expected = state.config.admin_token.as_deref().ok_or(ProxyError::Unauthorized)?;
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    match presented {
        Some(token) if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) => Ok(()),
        _ => Err(ProxyError::Unauthorized),
    }
}

async fn clear_cache_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(e) = authorize(&state, &headers) {
        return e.into_response();
    }
    let cleared = state.cache.clear();
    tracing::info!("Cleared {} image cache entries", cleared);
    Json(serde_json::json!({ "cleared": cleared })).into_response()
}

async fn delete_entry_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ImageQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = authorize(&state, &headers) {
        return e.into_response();
    }
    let key = match query.resolve(&state.config) {
        Ok((_, key)) => key,
        Err(e) => return e.into_response(),
    };
    let deleted = state.cache.delete(&key);
    tracing::info!("Deleted cache entry {}: {}", key, deleted);
    Json(serde_json::json!({ "deleted": deleted, "key": key.to_string() })).into_response()
}

pub fn router(state: Arc<AppState>) -> Router {
    // Observability endpoints - NO rate limiting
    let observability_routes = Router::new()
        .route("/health", get(health_handler))
        .route("/stats/cache", get(cache_stats_handler))
        .route("/metrics", get(metrics_handler));

    let mut image_routes = Router::new()
        .route("/img", get(image_handler))
        .layer(CatchPanicLayer::custom(panic_response));

    if state.config.rate_limit {
        // 10 req/sec per IP, burst of 30
        match GovernorConfigBuilder::default().per_second(10).burst_size(30).finish() {
            Some(governor_conf) => {
                tracing::info!("Image route rate limited: 10/sec, burst 30");
                image_routes = image_routes.layer(GovernorLayer {
                    config: Box::leak(Box::new(governor_conf)),
                });
            }
            None => tracing::warn!("Invalid rate limit configuration, rate limiting disabled"),
        }
    } else {
        tracing::info!("Rate limiting disabled");
    }

    let mut app = Router::new().merge(observability_routes).merge(image_routes);

    if state.config.admin_token.is_some() {
        app = app
            .route("/admin/cache", delete(clear_cache_handler))
            .route("/admin/cache/entry", delete(delete_entry_handler));
    }

    app.with_state(state).layer(TraceLayer::new_for_http())
}
