//! Scripted in-memory page source shared by the pipeline tests
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use price_tracker::crawling::{
    AcquisitionError, AcquisitionPolicy, AcquisitionSession, BrowserHostError, CatalogPipeline, DiagnosticsCapture,
    PageSource, PipelineConfig,
};

/// Bytes returned as the diagnostics snapshot
pub const FAKE_PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

#[derive(Debug, Default, Clone)]
pub struct SourceLog {
    pub started: usize,
    pub stopped: usize,
    pub opened: usize,
    pub closed: usize,
    pub acquired: Vec<String>,
    pub snapshots: usize,
}

type Scripts = Arc<Mutex<HashMap<String, VecDeque<Result<String, AcquisitionError>>>>>;

#[derive(Default)]
pub struct ScriptedSource {
    scripts: Scripts,
    log: Arc<Mutex<SourceLog>>,
    fail_start: bool,
    failing_snapshots: bool,
    cancel_on_acquire: Option<CancellationToken>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next acquisition of `url` returns `text`
    pub fn price(self, url: &str, text: &str) -> Self {
        self.push(url, Ok(text.to_string()))
    }

    /// Next acquisition of `url` fails with `error`
    pub fn fail(self, url: &str, error: AcquisitionError) -> Self {
        self.push(url, Err(error))
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn failing_snapshots(mut self) -> Self {
        self.failing_snapshots = true;
        self
    }

    /// Cancel `token` as soon as any listing is acquired
    pub fn cancel_on_acquire(mut self, token: CancellationToken) -> Self {
        self.cancel_on_acquire = Some(token);
        self
    }

    pub fn log(&self) -> SourceLog {
        self.log.lock().unwrap().clone()
    }

    fn push(self, url: &str, outcome: Result<String, AcquisitionError>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(outcome);
        self
    }
}

#[async_trait]
impl PageSource for ScriptedSource {
    async fn start(&mut self) -> Result<(), BrowserHostError> {
        self.log.lock().unwrap().started += 1;
        if self.fail_start {
            return Err(BrowserHostError::Launch {
                reason: "chrome not found".to_string(),
            });
        }
        Ok(())
    }

    async fn open_session(&mut self) -> Result<Box<dyn AcquisitionSession>, AcquisitionError> {
        self.log.lock().unwrap().opened += 1;
        Ok(Box::new(ScriptedSession {
            scripts: Arc::clone(&self.scripts),
            log: Arc::clone(&self.log),
            failing_snapshots: self.failing_snapshots,
            cancel_on_acquire: self.cancel_on_acquire.clone(),
            closed: false,
        }))
    }

    async fn stop(&mut self) {
        self.log.lock().unwrap().stopped += 1;
    }
}

struct ScriptedSession {
    scripts: Scripts,
    log: Arc<Mutex<SourceLog>>,
    failing_snapshots: bool,
    cancel_on_acquire: Option<CancellationToken>,
    closed: bool,
}

#[async_trait]
impl AcquisitionSession for ScriptedSession {
    async fn acquire(&mut self, url: &str, selector: &str, policy: &AcquisitionPolicy) -> Result<String, AcquisitionError> {
        self.log.lock().unwrap().acquired.push(url.to_string());
        if let Some(token) = &self.cancel_on_acquire {
            token.cancel();
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| {
            Err(AcquisitionError::SelectorTimeout {
                selector: selector.to_string(),
                timeout: policy.selector_timeout,
            })
        })
    }

    async fn snapshot(&mut self) -> Result<Vec<u8>, AcquisitionError> {
        if self.failing_snapshots {
            return Err(AcquisitionError::browser("screenshot target closed"));
        }
        self.log.lock().unwrap().snapshots += 1;
        Ok(FAKE_PNG.to_vec())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.log.lock().unwrap().closed += 1;
        }
    }
}

pub fn selector_timeout() -> AcquisitionError {
    AcquisitionError::SelectorTimeout {
        selector: ".price".to_string(),
        timeout: Duration::from_secs(15),
    }
}

pub fn navigation_timeout(url: &str) -> AcquisitionError {
    AcquisitionError::NavigationTimeout {
        url: url.to_string(),
        timeout: Duration::from_secs(90),
    }
}

/// Pipeline with no pacing or retry delay, writing snapshots to `diagnostics_dir`
pub fn pipeline(diagnostics_dir: &Path, retry_attempts: u32) -> CatalogPipeline {
    let config = PipelineConfig {
        retry_attempts,
        retry_delay: Duration::ZERO,
        listing_delay: Duration::ZERO,
        listing_jitter: Duration::ZERO,
        ..PipelineConfig::default()
    };
    CatalogPipeline::new(config, DiagnosticsCapture::new(diagnostics_dir))
}

pub const STORE_A_URL: &str = "https://store-a.example/acme-x1";
pub const STORE_B_URL: &str = "https://store-b.example/p/acme-x1";

/// One brand "Acme", one model "X1", two stores
pub fn acme_catalog() -> Value {
    json!([{
        "brand": "Acme",
        "models": [{
            "model": "X1",
            "stores": [
                {
                    "store": "Store A",
                    "url": STORE_A_URL,
                    "price_selector": ".price-box .amount",
                    "history": [{ "timestamp": "2025-01-01T10:00:00.000Z", "price": 49990 }]
                },
                {
                    "store": "Store B",
                    "url": STORE_B_URL,
                    "price_selector": "#product-price",
                    "history": []
                }
            ]
        }]
    }])
}

pub async fn write_catalog(dir: &Path, document: &Value) -> PathBuf {
    let path = dir.join("catalog.json");
    let rendered = serde_json::to_string_pretty(document).unwrap();
    tokio::fs::write(&path, rendered).await.unwrap();
    path
}

pub async fn read_json(path: &Path) -> Value {
    let bytes = tokio::fs::read(path).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn artifacts(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
