//! Testing utilities for scanflow pipelines.
//!
//! This module provides:
//! - Scripted and blocking stages
//! - A static provider
//! - Fast configurations and a started test harness

mod fixtures;
mod mocks;

pub use fixtures::{fast_config, utc, TestHarness};
pub use mocks::{BlockingStage, ScriptedStage, StaticProvider};
