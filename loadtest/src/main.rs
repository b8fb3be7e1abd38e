use goose::prelude::*;
use rand::Rng;

/// Load testing suite for the image proxy.
///
/// Traffic mix:
/// - preset requests against one object, re-signed every time (cache hits
///   once the first variant is stored)
/// - custom widths (cache misses, full fetch + transform)
/// - the health endpoint
///
/// The source object must live on an allowlisted origin; override it with
/// `LOADTEST_SOURCE_URL`.
///
/// # Usage
/// ```bash
/// cd loadtest
/// LOADTEST_SOURCE_URL=https://prod-files-secure.s3.us-west-2.amazonaws.com/ws/photo.jpg \
///   cargo run --release -- --host http://localhost:8080 --users 10 --hatch-rate 2 --run-time 60s
/// ```
///
/// # Performance Targets
/// - Cache hits: <20ms p95 latency
/// - Cache misses: <400ms p95 latency
/// - Error rate: <1%

const DEFAULT_SOURCE: &str = "https://prod-files-secure.s3.us-west-2.amazonaws.com/loadtest/sample.jpg";
const PRESETS: [&str; 4] = ["thumbnail", "small", "medium", "large"];

#[tokio::main]
async fn main() -> Result<(), GooseError> {
    GooseAttack::initialize()?
        .register_scenario(
            scenario!("CachePerformance")
                .register_transaction(transaction!(cached_preset).set_weight(15)?)
                .register_transaction(transaction!(uncached_width).set_weight(5)?)
        )
        .register_scenario(
            scenario!("Availability")
                .register_transaction(transaction!(health_check).set_weight(1)?)
        )
        .execute()
        .await?;

    Ok(())
}

fn source_url() -> String {
    std::env::var("LOADTEST_SOURCE_URL").unwrap_or_else(|_| DEFAULT_SOURCE.to_string())
}

/// Appends a fresh fake SigV4 signature, the way the origin hands out a new
/// URL for the same object on every page load.
fn resigned(source: &str) -> String {
    let now = chrono::Utc::now();
    let signature: u64 = rand::thread_rng().gen();
    let sep = if source.contains('?') { '&' } else { '?' };
    format!(
        "{source}{sep}X-Amz-Algorithm=AWS4-HMAC-SHA256&X-Amz-Date={}&X-Amz-Expires=3600&X-Amz-Signature={:016x}",
        now.format("%Y%m%dT%H%M%SZ"),
        signature
    )
}

fn img_path(params: &[(&str, &str)]) -> String {
    let query = serde_urlencoded::to_string(params).unwrap_or_default();
    format!("/img?{query}")
}

/// Same object and preset each time, so only the first request misses.
async fn cached_preset(user: &mut GooseUser) -> TransactionResult {
    // Build the path before awaiting; the rng is not Send.
    let path = {
        let preset = PRESETS[rand::thread_rng().gen_range(0..PRESETS.len())];
        img_path(&[("url", resigned(&source_url()).as_str()), ("size", preset)])
    };
    let _goose = user.get(&path).await?;
    Ok(())
}

/// Random custom width, which almost always produces a new variant.
async fn uncached_width(user: &mut GooseUser) -> TransactionResult {
    let path = {
        let width = rand::thread_rng().gen_range(100..2000).to_string();
        img_path(&[("url", resigned(&source_url()).as_str()), ("w", width.as_str()), ("q", "85")])
    };
    let _goose = user.get(&path).await?;
    Ok(())
}

async fn health_check(user: &mut GooseUser) -> TransactionResult {
    let _goose = user.get("/health").await?;
    Ok(())
}
