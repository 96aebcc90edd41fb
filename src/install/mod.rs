//! Mounting the new layout and writing its mount tables

mod crypttab;
mod fstab;
mod installer;
pub mod mount;

pub use crypttab::*;
pub use fstab::*;
pub use installer::*;
