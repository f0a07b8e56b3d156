use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::emulation::SetUserAgentOverrideParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use trawl_core::error::AppError;
use trawl_core::models::{Identity, Target};
use trawl_core::traits::{FetcherFactory, PageFetcher};

/// True for the title GitHub renders on its 404 page.
///
/// Matched from the start of the title: a repository may well have "404"
/// in its name or description.
fn is_not_found_title(title: &str) -> bool {
    let title = title.trim();
    title.starts_with("Page not found") || title == "404" || title.starts_with("404 ·")
}

/// Spawns `cleanup` when dropped, so it also runs when the owning future is
/// cancelled mid-await.
struct OnDrop<F: Future<Output = ()> + Send + 'static> {
    cleanup: Option<F>,
}

impl<F: Future<Output = ()> + Send + 'static> OnDrop<F> {
    fn new(cleanup: F) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }
}

impl<F: Future<Output = ()> + Send + 'static> Drop for OnDrop<F> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take()
            && let Ok(handle) = tokio::runtime::Handle::try_current()
        {
            handle.spawn(cleanup);
        }
    }
}

struct Session {
    browser: Browser,
    proxy: Option<String>,
    handler: JoinHandle<()>,
}

impl Session {
    async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            tracing::debug!(error = %e, "Browser close failed");
        }
        let _ = self.browser.wait().await;
        self.handler.abort();
    }
}

/// Headless-browser fetcher using Chromium via the Chrome DevTools Protocol.
///
/// Renders JavaScript before returning the HTML. Each instance owns one
/// Chromium process. Chromium takes its proxy as a launch flag, so the
/// process is relaunched whenever the identity's proxy changes; the
/// User-Agent is overridden per tab.
///
/// # Example
///
/// ```rust,no_run
/// use trawl_client::BrowserFetcher;
/// use trawl_core::models::{DEFAULT_BASE_URL, Identity, Target};
/// use trawl_core::traits::PageFetcher;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let fetcher = BrowserFetcher::launch(None).await?;
/// let target = Target::parse("tokio-rs/tokio", &DEFAULT_BASE_URL.parse()?)?;
/// let identity = Identity { proxy: None, user_agent: "Mozilla/5.0".into() };
/// let html = fetcher
///     .fetch(&target, &identity, std::time::Duration::from_secs(30))
///     .await?;
/// println!("{}", &html[..200]);
/// # Ok(())
/// # }
/// ```
pub struct BrowserFetcher {
    session: Mutex<Option<Session>>,
}

impl BrowserFetcher {
    /// Launch a headless Chromium, optionally behind `proxy`.
    ///
    /// Requires a Chromium / Chrome binary reachable via `$PATH`, `CHROME_BIN`
    /// or one of the usual install locations.
    pub async fn launch(proxy: Option<&str>) -> Result<Self, AppError> {
        let session = start_session(proxy).await?;
        Ok(Self {
            session: Mutex::new(Some(session)),
        })
    }

    /// Close the browser process. Later fetches relaunch it.
    pub async fn shutdown(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.close().await;
        }
    }

    async fn render(&self, target: &Target, identity: &Identity) -> Result<String, AppError> {
        let mut guard = self.session.lock().await;

        let stale = guard
            .as_ref()
            .is_none_or(|s| s.proxy.as_deref() != identity.proxy.as_deref());
        if stale {
            if let Some(old) = guard.take() {
                tracing::debug!(proxy = ?identity.proxy, "Proxy changed, relaunching browser");
                old.close().await;
            }
            *guard = Some(start_session(identity.proxy.as_deref()).await?);
        }
        let session = guard
            .as_ref()
            .ok_or_else(|| AppError::FetcherFatal("browser session missing".into()))?;

        let page = session
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| AppError::FetcherFatal(format!("Failed to open tab: {e}")))?;

        let tab = page.clone();
        let _close_tab = OnDrop::new(async move {
            if let Err(e) = tab.close().await {
                tracing::debug!(error = %e, "Tab close failed");
            }
        });
        load(&page, target, identity).await
    }
}

async fn load(page: &Page, target: &Target, identity: &Identity) -> Result<String, AppError> {
    let url = target.url().as_str();

    page.set_user_agent(SetUserAgentOverrideParams::new(identity.user_agent.clone()))
        .await
        .map_err(|e| AppError::FetcherFatal(format!("Failed to set user agent: {e}")))?;

    page.goto(url)
        .await
        .map_err(|e| AppError::NetworkError(format!("Failed to navigate to {url}: {e}")))?;

    page.find_element("body")
        .await
        .map_err(|e| AppError::NetworkError(format!("Page did not render body: {e}")))?;

    if let Ok(Some(title)) = page.get_title().await
        && is_not_found_title(&title)
    {
        return Err(AppError::NotFound(url.to_string()));
    }

    page.content()
        .await
        .map_err(|e| AppError::NetworkError(format!("Failed to read page content: {e}")))
}

async fn start_session(proxy: Option<&str>) -> Result<Session, AppError> {
    let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();

    if let Some(bin) = find_chrome_binary() {
        tracing::info!("Using Chrome binary: {}", bin.display());
        builder = builder.chrome_executable(bin);
    }
    if let Some(proxy) = proxy {
        builder = builder.arg(format!("--proxy-server={proxy}"));
    }

    let config = builder
        .arg("--headless=new")
        .arg("--disable-gpu")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-extensions")
        .arg("--no-first-run")
        .build()
        .map_err(|e| AppError::FetcherFatal(format!("Browser config error: {e}")))?;

    let (browser, mut events) = Browser::launch(config)
        .await
        .map_err(|e| AppError::FetcherFatal(format!("Failed to launch browser: {e}")))?;

    // The CDP handler must be polled for the connection to make progress.
    let handler = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if let Err(e) = event {
                tracing::warn!(error = %e, "Browser CDP handler error");
                break;
            }
        }
    });

    tracing::info!(proxy = ?proxy, "Browser launched");
    Ok(Session {
        browser,
        proxy: proxy.map(String::from),
        handler,
    })
}

/// Locate a Chrome/Chromium binary, preferring `CHROME_BIN`.
///
/// The snap wrapper at `/snap/bin/chromium` strips unknown flags and breaks
/// headless mode, so the binary inside the snap is tried first. `None` lets
/// chromiumoxide do its own lookup.
fn find_chrome_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }

    [
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ]
    .iter()
    .map(PathBuf::from)
    .find(|p| p.exists())
}

impl PageFetcher for BrowserFetcher {
    async fn fetch(
        &self,
        target: &Target,
        identity: &Identity,
        timeout: Duration,
    ) -> Result<String, AppError> {
        match tokio::time::timeout(timeout, self.render(target, identity)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(timeout.as_secs())),
        }
    }
}

/// Launches one browser per worker.
///
/// The first browser starts without a proxy; it is relaunched on the first
/// fetch whose identity carries one.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrowserFetcherFactory;

impl FetcherFactory for BrowserFetcherFactory {
    type Fetcher = BrowserFetcher;

    async fn create(&self) -> Result<BrowserFetcher, AppError> {
        BrowserFetcher::launch(None).await
    }
}
