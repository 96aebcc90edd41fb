//! architect - disk layout planner and executor for fresh Linux installations

pub mod cleanup;
pub mod config;
pub mod configure;
pub mod disk;
pub mod install;
pub mod utils;

pub use config::{LayoutConfig, LayoutRequest};
pub use utils::error::ArchitectError;
