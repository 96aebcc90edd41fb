//! Disk inspection, layout planning and filesystem creation

pub mod detection;
pub mod formatting;
pub mod layouts;
pub mod partitioning;
pub mod volumes;
