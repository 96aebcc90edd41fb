//! Encryption of the system partition

pub mod encryption;
