//! Utility Module
//!
//! - [`interner`]: global string interner backing shader define sets

pub mod interner;
