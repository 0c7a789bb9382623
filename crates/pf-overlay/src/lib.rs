//! # pf-overlay
//!
//! Per-algorithm parameter overrides.
//!
//! Overrides are collected by an [`OverlayBuilder`] (either for every
//! algorithm or for a single one) and resolved into a read-only
//! [`ParameterOverlay`]: general overrides are applied to each algorithm's
//! fresh defaults first, algorithm-specific ones second, so the specific
//! value wins on conflict.

mod config;
mod overlay;

pub use config::OverlayConfig;
pub use overlay::{OverlayBuilder, ParameterOverlay};
