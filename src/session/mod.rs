//! Session management module

pub mod manager;

pub use manager::{Group, GroupMode, Manager, Stats};
