//! Layout request and configuration file handling

mod layout;

pub use layout::*;
