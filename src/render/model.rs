use crate::resources::{CDT_CONTENT_TYPE, RawResource, Resource, ResourceMap, ResourceRef};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Server-reported lifecycle of one render job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenderStatus {
    NeedMoreResources,
    Rendering,
    Rendered,
    Error,
}

impl RenderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rendered | Self::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub left: i64,
    pub top: i64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreenOrientation {
    Portrait,
    Landscape,
}

/// Mobile device emulation, either by preset name or by explicit metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmulationInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_scale_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_orientation: Option<ScreenOrientation>,
}

/// Target browser of one render
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BrowserInfo {
    Desktop {
        name: String,
        width: u32,
        height: u32,
    },
    Emulation {
        #[serde(rename = "chromeEmulationInfo")]
        emulation: EmulationInfo,
    },
}

impl BrowserInfo {
    pub fn desktop(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self::Desktop {
            name: name.into(),
            width,
            height,
        }
    }

    pub fn device(device_name: impl Into<String>) -> Self {
        Self::Emulation {
            emulation: EmulationInfo {
                device_name: Some(device_name.into()),
                ..EmulationInfo::default()
            },
        }
    }

    pub fn browser_name(&self) -> &str {
        match self {
            Self::Desktop { name, .. } => name,
            Self::Emulation { .. } => "chrome",
        }
    }

    fn render_info(&self) -> RenderInfoWire<'_> {
        match self {
            Self::Desktop { width, height, .. } => RenderInfoWire {
                width: Some(*width),
                height: Some(*height),
                size_mode: "full-page",
                emulation_info: None,
            },
            Self::Emulation { emulation } => RenderInfoWire {
                width: emulation.width,
                height: emulation.height,
                size_mode: "full-page",
                emulation_info: Some(emulation),
            },
        }
    }
}

/// Captured page: serialized DOM tree plus the resources it references
#[derive(Debug, Clone, Default)]
pub struct DomSnapshot {
    pub url: String,
    /// Normalized DOM node list
    pub cdt: serde_json::Value,
    pub resource_urls: Vec<String>,
    /// Content the browser already captured (blobs, inline frames)
    pub resources: HashMap<String, RawResource>,
}

impl DomSnapshot {
    /// Content-addressed DOM document referencing every resolved resource
    pub fn to_resource(&self, resources: &ResourceMap) -> Result<Resource, serde_json::Error> {
        let refs: BTreeMap<&str, ResourceRef> = resources
            .iter()
            .map(|(url, resource)| (url.as_str(), resource.to_ref()))
            .collect();

        let content = serde_json::to_vec(&serde_json::json!({
            "resources": refs,
            "domNodes": self.cdt,
        }))?;

        Ok(Resource::from_content(
            self.url.clone(),
            CDT_CONTENT_TYPE,
            content.into(),
            Vec::new(),
        ))
    }
}

/// One render job: a page snapshot for one browser configuration
#[derive(Debug, Clone)]
pub struct RenderRequest {
    /// Local correlation id, never sent to the grid
    pub id: Uuid,
    pub url: String,
    pub dom: Resource,
    pub resources: ResourceMap,
    pub browser: BrowserInfo,
    pub region_selectors: Vec<String>,
    pub options: Option<serde_json::Value>,
    pub user_agent: Option<String>,
    pub agent_id: String,
    /// Set on resubmission so the grid continues the same job
    pub render_id: Option<String>,
    pub webhook: Option<String>,
}

impl RenderRequest {
    pub fn new(dom: Resource, resources: ResourceMap, browser: BrowserInfo) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: dom.url.clone(),
            dom,
            resources,
            browser,
            region_selectors: Vec::new(),
            options: None,
            user_agent: None,
            agent_id: String::new(),
            render_id: None,
            webhook: None,
        }
    }

    pub fn to_wire(&self) -> RenderRequestWire<'_> {
        RenderRequestWire {
            render_id: self.render_id.as_deref(),
            webhook: self.webhook.as_deref(),
            agent_id: &self.agent_id,
            url: &self.url,
            dom: self.dom.to_ref(),
            resources: self
                .resources
                .iter()
                .map(|(url, resource)| (url.as_str(), resource.to_ref()))
                .collect(),
            browser: BrowserWire {
                name: self.browser.browser_name(),
            },
            render_info: self.browser.render_info(),
            selectors_to_find_regions_for: &self.region_selectors,
            options: self.options.as_ref(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequestWire<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub render_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<&'a str>,
    pub agent_id: &'a str,
    pub url: &'a str,
    pub dom: ResourceRef,
    pub resources: BTreeMap<&'a str, ResourceRef>,
    pub browser: BrowserWire<'a>,
    pub render_info: RenderInfoWire<'a>,
    pub selectors_to_find_regions_for: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<&'a serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct BrowserWire<'a> {
    pub name: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderInfoWire<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    pub size_mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emulation_info: Option<&'a EmulationInfo>,
}

/// Response entry of `POST /render`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningRender {
    #[serde(default)]
    pub render_id: Option<String>,
    pub render_status: RenderStatus,
    #[serde(default)]
    pub need_more_resources: Vec<String>,
    #[serde(default)]
    pub need_more_dom: bool,
}

/// Response entry of `POST /render-status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderStatusResult {
    #[serde(default)]
    pub render_id: Option<String>,
    pub status: RenderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dom_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_size: Option<Size>,
    #[serde(default)]
    pub selector_regions: Vec<Vec<Region>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub need_more_resources: Option<Vec<String>>,
}

impl RenderStatusResult {
    /// Placeholder for an id the grid did not report on
    pub fn pending(render_id: impl Into<String>) -> Self {
        Self {
            render_id: Some(render_id.into()),
            status: RenderStatus::Rendering,
            image_location: None,
            dom_location: None,
            error: None,
            os: None,
            user_agent: None,
            device_size: None,
            selector_regions: Vec::new(),
            need_more_resources: None,
        }
    }
}

/// Render service bootstrap returned by the visual-diff server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderInfo {
    pub service_url: String,
    pub access_token: String,
    #[serde(default)]
    pub results_url: Option<String>,
}
