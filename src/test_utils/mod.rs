//! Test utilities for the billing engine.
//!
//! This module provides:
//! - Test data factories for creating valid fixtures and webhook bodies
//! - An in-memory store implementing every repository trait
//! - Fakes for the billing provider, cache and notifier
//! - A harness wiring the use cases together, plus an `AppState` builder for
//!   HTTP tests

mod app_state_builder;
mod billing_store;
mod factories;
mod fakes;
mod harness;

pub use app_state_builder::*;
pub use billing_store::*;
pub use factories::*;
pub use fakes::*;
pub use harness::*;
