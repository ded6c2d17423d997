//! Render grid orchestration
//!
//! Builds render requests from page snapshots, keeps the grid supplied
//! with resource content and schedules render jobs under the render and
//! session concurrency limits.

pub mod grid;
pub mod model;
pub mod pool;
pub mod scheduler;
pub mod uploader;

#[cfg(test)]
pub(crate) mod testing;

pub use grid::{HttpRenderGrid, RenderGrid};
pub use model::{
    BrowserInfo, DomSnapshot, EmulationInfo, RenderInfo, RenderRequest, RenderStatus,
    RenderStatusResult, RunningRender, ScreenOrientation,
};
pub use pool::{ConcurrencyPool, PoolError, PoolSlot, PoolStats};
pub use scheduler::{RenderError, RenderScheduler, SchedulerConfig};
pub use uploader::ResourceUploader;
