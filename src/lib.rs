pub mod config;
pub mod driver;
pub mod http;
pub mod humanize;
pub mod matching;
pub mod observability;
pub mod render;
pub mod resources;
pub mod session;
