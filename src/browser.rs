/// Browser host boundary used by the background orchestrator.
///
/// The real implementation is the extension's tabs/runtime API; tests use the
/// recording browser in `test_support`.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BrowserError;
use crate::messages::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub u32);

impl std::fmt::Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who sent a runtime message to the background.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageSender {
    pub tab_id: Option<TabId>,
    pub url: Option<String>,
}

impl MessageSender {
    pub fn tab(tab_id: TabId) -> Self {
        Self {
            tab_id: Some(tab_id),
            url: None,
        }
    }

    pub fn extension() -> Self {
        Self::default()
    }
}

#[async_trait]
pub trait BrowserApi: Send + Sync {
    async fn create_tab(&self, url: &str) -> Result<TabId, BrowserError>;
    async fn remove_tab(&self, tab: TabId) -> Result<(), BrowserError>;
    async fn focus_tab(&self, tab: TabId) -> Result<(), BrowserError>;
    async fn send_to_tab(&self, tab: TabId, message: Envelope) -> Result<(), BrowserError>;

    /// Delivers to every extension context listening on the runtime
    /// (popup, options page, offscreen document).
    async fn broadcast(&self, message: Envelope) -> Result<(), BrowserError>;
}
