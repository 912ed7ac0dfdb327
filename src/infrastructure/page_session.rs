//! Page acquisition session backed by Chrome DevTools Protocol
//!
//! Each session owns a fresh browser context (separate cookies, storage and
//! cache) with a single page in it. The context is disposed when the session
//! is closed, or from `Drop` on paths where `close` was never awaited.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::emulation::{SetDeviceMetricsOverrideParams, SetUserAgentOverrideParams};
use chromiumoxide::cdp::browser_protocol::fetch::{self, EventRequestPaused, FailRequestParams, RequestPattern};
use chromiumoxide::cdp::browser_protocol::network::{ErrorReason, ResourceType};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, CaptureScreenshotFormat, EventDomContentEventFired, NavigateParams,
};
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::crawling::acquisition::{AcquisitionError, AcquisitionPolicy, AcquisitionSession, LoadCondition};
use crate::infrastructure::identity::IdentityStrategy;

const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(250);
const NETWORK_IDLE_QUIET_MS: u64 = 1000;

/// Subresource types that may be aborted before they are fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockedResource {
    Image,
    Stylesheet,
    Font,
    Media,
}

impl BlockedResource {
    const fn resource_type(self) -> ResourceType {
        match self {
            Self::Image => ResourceType::Image,
            Self::Stylesheet => ResourceType::Stylesheet,
            Self::Font => ResourceType::Font,
            Self::Media => ResourceType::Media,
        }
    }
}

/// Page setup applied to every new session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub identity: Arc<dyn IdentityStrategy>,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub block_resources: Vec<BlockedResource>,
}

/// Result of reading the first element matching a selector
#[derive(Debug, Deserialize)]
struct ElementText {
    found: bool,
    text: String,
}

pub struct PageSession {
    browser: Arc<Mutex<Browser>>,
    page: Option<Page>,
    context_id: Option<BrowserContextId>,
    interceptor: Option<JoinHandle<()>>,
}

impl PageSession {
    /// Create an isolated context with one configured blank page
    pub async fn open(browser: Arc<Mutex<Browser>>, options: &SessionOptions) -> Result<Self, AcquisitionError> {
        let (context_id, page) = {
            let guard = browser.lock().await;
            let context_id = guard
                .execute(CreateBrowserContextParams::default())
                .await
                .map_err(AcquisitionError::browser)?
                .result
                .browser_context_id;

            let target = CreateTargetParams::builder()
                .url("about:blank")
                .browser_context_id(context_id.clone())
                .build()
                .map_err(AcquisitionError::browser)?;

            match guard.new_page(target).await {
                Ok(page) => (context_id, page),
                Err(e) => {
                    if let Err(dispose) = guard.execute(DisposeBrowserContextParams::new(context_id)).await {
                        debug!("Failed to dispose browser context after page creation error: {}", dispose);
                    }
                    return Err(AcquisitionError::browser(e));
                }
            }
        };

        let mut session = Self {
            browser,
            page: Some(page),
            context_id: Some(context_id),
            interceptor: None,
        };

        if let Err(e) = session.configure(options).await {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    async fn configure(&mut self, options: &SessionOptions) -> Result<(), AcquisitionError> {
        let page = self.page()?.clone();

        page.execute(SetDeviceMetricsOverrideParams::new(
            i64::from(options.viewport_width),
            i64::from(options.viewport_height),
            1.0,
            false,
        ))
        .await
        .map_err(AcquisitionError::browser)?;

        page.execute(SetUserAgentOverrideParams::new(options.identity.user_agent()))
            .await
            .map_err(AcquisitionError::browser)?;

        for script in options.identity.bootstrap_scripts() {
            page.execute(AddScriptToEvaluateOnNewDocumentParams::new(*script))
                .await
                .map_err(AcquisitionError::browser)?;
        }

        if !options.block_resources.is_empty() {
            self.interceptor = Some(Self::block_resources(&page, &options.block_resources).await?);
        }

        debug!(
            "Session configured: identity={}, viewport={}x{}, blocked={:?}",
            options.identity.kind(),
            options.viewport_width,
            options.viewport_height,
            options.block_resources
        );
        Ok(())
    }

    /// Pause requests of the blocked types and fail each one as blocked by client
    async fn block_resources(page: &Page, blocked: &[BlockedResource]) -> Result<JoinHandle<()>, AcquisitionError> {
        let mut paused = page
            .event_listener::<EventRequestPaused>()
            .await
            .map_err(AcquisitionError::browser)?;

        let patterns = blocked
            .iter()
            .map(|resource| RequestPattern::builder().resource_type(resource.resource_type()).build());
        page.execute(fetch::EnableParams::builder().patterns(patterns).build())
            .await
            .map_err(AcquisitionError::browser)?;

        let page = page.clone();
        Ok(tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                let fail = FailRequestParams::new(event.request_id.clone(), ErrorReason::BlockedByClient);
                if let Err(e) = page.execute(fail).await {
                    debug!("Could not abort paused request {:?}: {}", event.request_id, e);
                }
            }
        }))
    }

    fn page(&self) -> Result<&Page, AcquisitionError> {
        self.page
            .as_ref()
            .ok_or_else(|| AcquisitionError::browser("session already closed"))
    }

    async fn navigate(page: &Page, url: &str, policy: &AcquisitionPolicy) -> Result<(), AcquisitionError> {
        let timeout = policy.navigation_timeout;
        let timed_out = || AcquisitionError::NavigationTimeout {
            url: url.to_string(),
            timeout,
        };
        let cdp_failure = |e: CdpError| match e {
            CdpError::Timeout => timed_out(),
            other => AcquisitionError::browser(other),
        };

        let navigation = async {
            match policy.load_condition {
                LoadCondition::Load => {
                    page.goto(url).await.map_err(cdp_failure)?;
                }
                LoadCondition::DomContentLoaded => {
                    // subscribe first so the event of the new document cannot be missed
                    let mut dom_ready = page
                        .event_listener::<EventDomContentEventFired>()
                        .await
                        .map_err(AcquisitionError::browser)?;
                    let response = page.execute(NavigateParams::new(url)).await.map_err(cdp_failure)?;
                    if let Some(error_text) = &response.result.error_text {
                        return Err(AcquisitionError::browser(format!("navigation to {url} failed: {error_text}")));
                    }
                    // same-document navigations carry no loader and fire no DOMContentLoaded
                    if response.result.loader_id.is_some() && dom_ready.next().await.is_none() {
                        return Err(AcquisitionError::browser("page closed before DOMContentLoaded"));
                    }
                }
                LoadCondition::NetworkIdle => {
                    page.goto(url).await.map_err(cdp_failure)?;
                    wait_for_network_idle(page, timeout).await;
                }
            }
            Ok(())
        };

        tokio::time::timeout(timeout, navigation)
            .await
            .unwrap_or_else(|_| Err(timed_out()))
    }

    async fn wait_for_selector(page: &Page, selector: &str, timeout: Duration) -> Result<(), AcquisitionError> {
        let poll = async {
            loop {
                match page.find_element(selector).await {
                    Ok(_) => return,
                    Err(e) => debug!("Selector '{}' not present yet: {}", selector, e),
                }
                tokio::time::sleep(SELECTOR_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| AcquisitionError::SelectorTimeout {
                selector: selector.to_string(),
                timeout,
            })
    }

    async fn extract_text(page: &Page, selector: &str) -> Result<String, AcquisitionError> {
        let literal = serde_json::to_string(selector).map_err(AcquisitionError::browser)?;
        let script = format!(
            "(() => {{ const el = document.querySelector({literal}); \
             return {{ found: el !== null, text: el ? (el.textContent || '') : '' }}; }})()"
        );

        let element: ElementText = page
            .evaluate(script)
            .await
            .map_err(AcquisitionError::browser)?
            .into_value()
            .map_err(AcquisitionError::browser)?;

        if !element.found {
            return Err(AcquisitionError::EmptyContent {
                selector: selector.to_string(),
            });
        }
        Ok(element.text)
    }
}

#[async_trait]
impl AcquisitionSession for PageSession {
    async fn acquire(&mut self, url: &str, selector: &str, policy: &AcquisitionPolicy) -> Result<String, AcquisitionError> {
        let target = url::Url::parse(url).map_err(|e| AcquisitionError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let page = self.page()?.clone();
        Self::navigate(&page, target.as_str(), policy).await?;
        Self::wait_for_selector(&page, selector, policy.selector_timeout).await?;
        Self::extract_text(&page, selector).await
    }

    async fn snapshot(&mut self) -> Result<Vec<u8>, AcquisitionError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        self.page()?.screenshot(params).await.map_err(AcquisitionError::browser)
    }

    async fn close(&mut self) {
        if let Some(task) = self.interceptor.take() {
            task.abort();
        }
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                debug!("Failed to close page: {}", e);
            }
        }
        if let Some(context_id) = self.context_id.take() {
            let browser = self.browser.lock().await;
            if let Err(e) = browser.execute(DisposeBrowserContextParams::new(context_id)).await {
                warn!("Failed to dispose browser context: {}", e);
            }
        }
    }
}

impl Drop for PageSession {
    fn drop(&mut self) {
        if let Some(task) = self.interceptor.take() {
            task.abort();
        }
        if self.page.is_none() && self.context_id.is_none() {
            return;
        }

        let page = self.page.take();
        let context_id = self.context_id.take();
        let browser = Arc::clone(&self.browser);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Session dropped without close, releasing context in background");
                handle.spawn(async move {
                    if let Some(page) = page {
                        let _ = page.close().await;
                    }
                    if let Some(context_id) = context_id {
                        let browser = browser.lock().await;
                        let _ = browser.execute(DisposeBrowserContextParams::new(context_id)).await;
                    }
                });
            }
            Err(_) => warn!("Session dropped outside a runtime, browser context left to process shutdown"),
        }
    }
}

/// Wait until `document.readyState` is complete and the resource count stops growing
async fn wait_for_network_idle(page: &Page, timeout: Duration) {
    let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    let script = format!(
        r"(async () => {{
            const timeoutMs = {timeout_ms};
            const idleMs = {NETWORK_IDLE_QUIET_MS};
            const interval = 250;
            const count = () => {{ try {{ return performance.getEntriesByType('resource').length; }} catch (_) {{ return 0; }} }};

            const start = Date.now();
            let lastCount = count();
            let stableMs = 0;
            while (Date.now() - start < timeoutMs) {{
                await new Promise(r => setTimeout(r, interval));
                const current = count();
                if (document.readyState === 'complete' && current === lastCount) {{
                    stableMs += interval;
                    if (stableMs >= idleMs) {{
                        return {{ ok: true, resources: current }};
                    }}
                }} else {{
                    stableMs = 0;
                }}
                lastCount = current;
            }}
            return {{ ok: false, resources: lastCount }};
        }})()"
    );

    match page.evaluate(script).await {
        Ok(result) => debug!("Network idle check: {:?}", result.value()),
        Err(e) => debug!("Network idle check failed: {}", e),
    }
}
