//! Browser host
//!
//! Owns the single Chrome process of a run. Sessions borrow it through a
//! shared handle; the process is closed by [`BrowserHost::shutdown`], and as
//! a last resort killed by chromiumoxide when the `Browser` is dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::crawling::acquisition::{AcquisitionError, AcquisitionSession, BrowserHostError, PageSource};
use crate::infrastructure::config::BrowserSettings;
use crate::infrastructure::identity::{IdentityStrategy, identity_for};
use crate::infrastructure::page_session::{PageSession, SessionOptions};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct RunningBrowser {
    browser: Arc<Mutex<Browser>>,
    handler: JoinHandle<()>,
}

pub struct BrowserHost {
    settings: BrowserSettings,
    identity: Arc<dyn IdentityStrategy>,
    running: Option<RunningBrowser>,
}

impl BrowserHost {
    /// Build a host; the identity strategy is fixed here for the whole run
    #[must_use]
    pub fn new(settings: BrowserSettings) -> Self {
        let identity = identity_for(settings.identity, settings.user_agent.as_deref());
        Self::with_identity(settings, identity)
    }

    #[must_use]
    pub fn with_identity(settings: BrowserSettings, identity: Arc<dyn IdentityStrategy>) -> Self {
        Self {
            settings,
            identity,
            running: None,
        }
    }

    #[must_use]
    pub fn identity(&self) -> &dyn IdentityStrategy {
        self.identity.as_ref()
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Command-line flags passed to Chrome, hardened ones first
    #[must_use]
    pub fn launch_args(&self) -> Vec<String> {
        self.settings
            .hardened_args
            .iter()
            .chain(self.settings.extra_args.iter())
            .cloned()
            .collect()
    }

    fn browser_config(&self) -> Result<BrowserConfig, BrowserHostError> {
        let mut builder = BrowserConfig::builder()
            .args(self.launch_args())
            .window_size(self.settings.viewport_width, self.settings.viewport_height)
            .viewport(None)
            .request_timeout(Duration::from_secs(self.settings.request_timeout_secs));

        if let Some(executable) = &self.settings.executable {
            builder = builder.chrome_executable(executable);
        }
        if !self.settings.headless {
            builder = builder.with_head();
        }

        builder.build().map_err(|reason| BrowserHostError::Config { reason })
    }

    /// Start the browser process
    pub async fn launch(&mut self) -> Result<(), BrowserHostError> {
        if self.running.is_some() {
            debug!("Browser already running");
            return Ok(());
        }

        let config = self.browser_config()?;
        let timeout = Duration::from_secs(self.settings.launch_timeout_secs);
        info!(
            "🚀 Launching browser (headless={}, identity={}, args={:?})",
            self.settings.headless,
            self.identity.kind(),
            self.launch_args()
        );

        let (browser, mut handler) = tokio::time::timeout(timeout, Browser::launch(config))
            .await
            .map_err(|_| BrowserHostError::LaunchTimeout { timeout })?
            .map_err(|e| BrowserHostError::Launch { reason: e.to_string() })?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("CDP handler event error: {}", e);
                }
            }
            debug!("CDP handler finished");
        });

        self.running = Some(RunningBrowser {
            browser: Arc::new(Mutex::new(browser)),
            handler,
        });
        info!("✅ Browser ready");
        Ok(())
    }

    /// Close the browser process and wait for it to exit
    pub async fn shutdown(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        {
            let mut browser = running.browser.lock().await;
            match tokio::time::timeout(SHUTDOWN_GRACE, browser.close()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("Browser close command failed: {}", e),
                Err(_) => warn!("Browser did not acknowledge close within {:?}", SHUTDOWN_GRACE),
            }
            match tokio::time::timeout(SHUTDOWN_GRACE, browser.wait()).await {
                Ok(Ok(status)) => debug!("Browser process exited: {:?}", status),
                Ok(Err(e)) => warn!("Failed to wait for browser process: {}", e),
                Err(_) => {
                    warn!("Browser process still alive after {:?}, killing it", SHUTDOWN_GRACE);
                    if let Some(Err(e)) = browser.kill().await {
                        warn!("Failed to kill browser process: {}", e);
                    }
                }
            }
        }

        running.handler.abort();
        info!("🛑 Browser stopped");
    }

    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            identity: Arc::clone(&self.identity),
            viewport_width: self.settings.viewport_width,
            viewport_height: self.settings.viewport_height,
            block_resources: self.settings.block_resources.clone(),
        }
    }
}

#[async_trait]
impl PageSource for BrowserHost {
    async fn start(&mut self) -> Result<(), BrowserHostError> {
        self.launch().await
    }

    async fn open_session(&mut self) -> Result<Box<dyn AcquisitionSession>, AcquisitionError> {
        let browser = self
            .running
            .as_ref()
            .map(|running| Arc::clone(&running.browser))
            .ok_or_else(|| AcquisitionError::browser("browser host is not running"))?;

        let session = PageSession::open(browser, &self.session_options()).await?;
        Ok(Box::new(session))
    }

    async fn stop(&mut self) {
        self.shutdown().await;
    }
}

impl Drop for BrowserHost {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            // dropping the last Browser handle kills the child process
            warn!("Browser host dropped while running");
            running.handler.abort();
        }
    }
}
