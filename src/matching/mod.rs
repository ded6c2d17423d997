//! Match-window checks against the visual-diff baseline

pub mod capture;
pub mod model;
pub mod task;

pub use capture::{CaptureError, DriverCapture, RenderCapture, ScreenshotProvider};
pub use model::{
    AppOutput, ImageMatchSettings, MatchAttempt, MatchLevel, MatchOptions, MatchResult,
    MatchWindowData,
};
pub use task::{MatchError, MatchSettings, MatchSubmitter, MatchWindowTask};
