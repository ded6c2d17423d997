//! Browser automation capability used by captures
//!
//! Each automation library gets one implementation of [`SpecDriver`];
//! nothing else in the crate looks at which library is behind it.

use crate::render::DomSnapshot;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("script failed: {0}")]
    Script(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("screenshot failed: {0}")]
    Screenshot(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// Opaque reference to a page element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementHandle {
    pub id: String,
    pub selector: String,
}

#[async_trait]
pub trait SpecDriver: Send + Sync {
    async fn find_element(&self, selector: &str) -> Result<Option<ElementHandle>>;

    async fn execute_script(&self, script: &str, args: Vec<serde_json::Value>) -> Result<serde_json::Value>;

    /// PNG of the current viewport
    async fn take_screenshot(&self) -> Result<Bytes>;

    async fn visit(&self, url: &str) -> Result<()>;

    async fn title(&self) -> Result<Option<String>> {
        let value = self.execute_script("return document.title", Vec::new()).await?;
        Ok(value.as_str().map(str::to_owned))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CapturedDom {
    url: String,
    cdt: serde_json::Value,
    #[serde(default)]
    resource_urls: Vec<String>,
}

/// Run a DOM capture script and read its `{url, cdt, resourceUrls}` result
pub async fn snapshot_page(driver: &dyn SpecDriver, capture_script: &str) -> Result<DomSnapshot> {
    let value = driver.execute_script(capture_script, Vec::new()).await?;
    let captured: CapturedDom = match value {
        serde_json::Value::String(raw) => serde_json::from_str::<CapturedDom>(&raw),
        other => serde_json::from_value::<CapturedDom>(other),
    }
    .map_err(|e| DriverError::Script(format!("unexpected capture result: {e}")))?;

    Ok(DomSnapshot {
        url: captured.url,
        cdt: captured.cdt,
        resource_urls: captured.resource_urls,
        resources: Default::default(),
    })
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedDriver;
    use super::*;

    #[tokio::test]
    async fn test_snapshot_page_reads_object_or_string() {
        let payload = serde_json::json!({
            "url": "https://s.test/",
            "cdt": [{ "nodeType": 9 }],
            "resourceUrls": ["https://s.test/a.css"],
        });

        let driver = ScriptedDriver::new(payload.clone());
        let snapshot = snapshot_page(&driver, "capture()").await.unwrap();
        assert_eq!(snapshot.url, "https://s.test/");
        assert_eq!(snapshot.resource_urls, vec!["https://s.test/a.css".to_string()]);

        let driver = ScriptedDriver::new(serde_json::Value::String(payload.to_string()));
        let snapshot = snapshot_page(&driver, "capture()").await.unwrap();
        assert_eq!(snapshot.cdt[0]["nodeType"], 9);
    }

    #[tokio::test]
    async fn test_bad_capture_result() {
        let driver = ScriptedDriver::new(serde_json::json!(42));
        let err = snapshot_page(&driver, "capture()").await.unwrap_err();
        assert!(matches!(err, DriverError::Script(_)));
    }

    #[tokio::test]
    async fn test_default_title_uses_script() {
        let driver = ScriptedDriver::new(serde_json::Value::Null);
        assert_eq!(driver.title().await.unwrap().as_deref(), Some("Scripted"));
        assert!(driver.find_element("#missing").await.unwrap().is_none());
        assert!(driver.visit("about:blank").await.is_err());
    }
}
