/// Smoke-test for `BrowserFetcher`.
///
/// Launches a headless Chromium, renders a repository page, and runs the
/// project extractor over it.
///
/// Run with:
///   cargo run -p trawl-client --example browser_smoke --features browser [owner/repo]
use std::time::Duration;

use trawl_client::{BrowserFetcher, ProjectPageExtractor};
use trawl_core::identity::DEFAULT_USER_AGENT;
use trawl_core::models::{DEFAULT_BASE_URL, Identity, Target};
use trawl_core::traits::{PageFetcher, RecordExtractor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let reference = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tokio-rs/tokio".to_string());
    let target = Target::parse(&reference, &DEFAULT_BASE_URL.parse()?)?;
    let identity = Identity {
        proxy: None,
        user_agent: DEFAULT_USER_AGENT.to_string(),
    };

    println!("Launching headless browser…");
    let fetcher = BrowserFetcher::launch(None).await?;

    println!("Fetching {} …", target.url());
    let html = fetcher
        .fetch(&target, &identity, Duration::from_secs(30))
        .await?;
    assert!(
        html.len() > 500,
        "HTML suspiciously short ({} bytes)",
        html.len()
    );

    let record = ProjectPageExtractor::new()?.extract(&target, &html)?;
    println!("OK: got {} bytes of rendered HTML", html.len());
    for (field, value) in &record.fields {
        println!("  {field}: {value}");
    }

    fetcher.shutdown().await;
    Ok(())
}
