//! Identity strategies presented to retailer sites
//!
//! The strategy is picked once, when the browser host is built, and applied
//! to every page the host opens: a user agent string plus optional scripts
//! evaluated before any document script runs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::infrastructure::config::defaults;

/// Configurable identity choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    /// Plain desktop Chrome user agent
    #[default]
    Desktop,
    /// Openly declared crawler
    Crawler,
    /// Desktop user agent plus automation fingerprint patches
    Stealth,
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Desktop => "desktop",
            Self::Crawler => "crawler",
            Self::Stealth => "stealth",
        };
        f.write_str(name)
    }
}

pub trait IdentityStrategy: Send + Sync + fmt::Debug {
    fn kind(&self) -> IdentityKind;

    fn user_agent(&self) -> &str;

    /// Scripts registered with `Page.addScriptToEvaluateOnNewDocument`
    fn bootstrap_scripts(&self) -> &[&'static str] {
        &[]
    }
}

/// Identity that only declares a user agent
#[derive(Debug, Clone)]
pub struct DeclaredIdentity {
    kind: IdentityKind,
    user_agent: String,
}

impl DeclaredIdentity {
    pub fn desktop(user_agent: impl Into<String>) -> Self {
        Self {
            kind: IdentityKind::Desktop,
            user_agent: user_agent.into(),
        }
    }

    pub fn crawler(user_agent: impl Into<String>) -> Self {
        Self {
            kind: IdentityKind::Crawler,
            user_agent: user_agent.into(),
        }
    }
}

impl IdentityStrategy for DeclaredIdentity {
    fn kind(&self) -> IdentityKind {
        self.kind
    }

    fn user_agent(&self) -> &str {
        &self.user_agent
    }
}

/// Desktop identity that also hides the usual headless-automation tells
#[derive(Debug, Clone)]
pub struct StealthIdentity {
    user_agent: String,
}

impl StealthIdentity {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }
}

impl IdentityStrategy for StealthIdentity {
    fn kind(&self) -> IdentityKind {
        IdentityKind::Stealth
    }

    fn user_agent(&self) -> &str {
        &self.user_agent
    }

    fn bootstrap_scripts(&self) -> &[&'static str] {
        STEALTH_SCRIPTS
    }
}

/// Build the strategy for a configured kind; `user_agent` replaces its default UA
#[must_use]
pub fn identity_for(kind: IdentityKind, user_agent: Option<&str>) -> Arc<dyn IdentityStrategy> {
    match kind {
        IdentityKind::Desktop => Arc::new(DeclaredIdentity::desktop(
            user_agent.unwrap_or(defaults::DESKTOP_USER_AGENT),
        )),
        IdentityKind::Crawler => Arc::new(DeclaredIdentity::crawler(
            user_agent.unwrap_or(defaults::CRAWLER_USER_AGENT),
        )),
        IdentityKind::Stealth => Arc::new(StealthIdentity::new(
            user_agent.unwrap_or(defaults::DESKTOP_USER_AGENT),
        )),
    }
}

const STEALTH_SCRIPTS: &[&str] = &[
    // navigator.webdriver
    r"
    Object.defineProperty(navigator, 'webdriver', {
        get: () => undefined,
        configurable: true
    });
    ",
    // window.chrome exists in headful Chrome only
    r"
    if (!window.chrome) {
        window.chrome = { runtime: {}, loadTimes: function() {}, csi: function() {}, app: {} };
    }
    ",
    r"
    if (window.navigator.permissions && window.navigator.permissions.query) {
        const originalQuery = window.navigator.permissions.query.bind(window.navigator.permissions);
        window.navigator.permissions.query = (parameters) => (
            parameters && parameters.name === 'notifications'
                ? Promise.resolve({ state: Notification.permission })
                : originalQuery(parameters)
        );
    }
    ",
    r"
    Object.defineProperty(navigator, 'plugins', {
        get: () => [
            { name: 'Chrome PDF Plugin', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
            { name: 'Chrome PDF Viewer', filename: 'mhjfbmdgcfjbbpaeojofohoefgiehjai', description: '' },
            { name: 'Native Client', filename: 'internal-nacl-plugin', description: '' }
        ],
        configurable: true
    });
    ",
    r"
    Object.defineProperty(navigator, 'languages', {
        get: () => ['es-CL', 'es', 'en-US', 'en'],
        configurable: true
    });
    ",
];
