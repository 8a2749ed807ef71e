//! # nearby-server
//!
//! HTTP server library for the nearby proximity discovery engine.
//!
//! This library provides the API handlers and state management that expose
//! the discovery channels of `nearby-core` to a UI.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod logging;
pub mod state;
