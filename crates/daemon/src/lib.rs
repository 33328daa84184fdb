// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! tl-daemon: configuration and lifecycle of the `tld` process

pub mod config;
pub mod lifecycle;
mod server;

pub use config::{Config, ConfigError, ShardConfig};
pub use lifecycle::{startup, Daemon, LifecycleError};
