use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Baseline comparison strictness
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchLevel {
    None,
    Layout,
    Content,
    #[default]
    Strict,
    Exact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub left: i64,
    pub top: i64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMatchSettings {
    pub match_level: MatchLevel,
    #[serde(default)]
    pub ignore_caret: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore: Vec<Region>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layout: Vec<Region>,
}

/// One captured state of the application under test
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Image already hosted elsewhere (render grid output)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dom_url: Option<String>,
    /// Raw image bytes, sent in a framed body next to the JSON
    #[serde(skip)]
    pub screenshot: Option<Bytes>,
}

/// Payload of one match-window submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchWindowData {
    pub app_output: AppOutput,
    pub tag: String,
    pub ignore_mismatch: bool,
    pub options: MatchOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchOptions {
    pub name: String,
    pub ignore_mismatch: bool,
    pub image_match_settings: ImageMatchSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub render_id: Option<String>,
}

impl MatchWindowData {
    pub fn new(app_output: AppOutput, tag: &str, settings: &ImageMatchSettings, ignore_mismatch: bool) -> Self {
        Self {
            app_output,
            tag: tag.to_string(),
            ignore_mismatch,
            options: MatchOptions {
                name: tag.to_string(),
                ignore_mismatch,
                image_match_settings: settings.clone(),
                render_id: None,
            },
        }
    }
}

/// Server verdict for one submission
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub as_expected: bool,
    #[serde(default)]
    pub window_id: Option<u64>,
}

/// Final attempt of a check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchAttempt {
    pub app_output: AppOutput,
    pub result: MatchResult,
    pub elapsed: Duration,
    /// Match-window calls made for this check
    pub submissions: u32,
}

impl MatchAttempt {
    pub fn as_expected(&self) -> bool {
        self.result.as_expected
    }
}
