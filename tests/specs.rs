//! Behavioral specifications for the tl and tld binaries.
//!
//! These tests are black-box: they invoke the binaries and verify
//! stdout, stderr, and exit codes.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

#[path = "specs/prelude.rs"]
mod prelude;

// cli/
#[path = "specs/cli/errors.rs"]
mod cli_errors;
#[path = "specs/cli/help.rs"]
mod cli_help;

// log/
#[path = "specs/log/cat.rs"]
mod log_cat;
#[path = "specs/log/dir.rs"]
mod log_dir;
#[path = "specs/log/verify.rs"]
mod log_verify;

// daemon/
#[path = "specs/daemon/startup.rs"]
mod daemon_startup;
