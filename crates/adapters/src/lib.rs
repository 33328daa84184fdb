// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
// Enable coverage(off) attribute for excluding test infrastructure
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Adapters for peer I/O
//!
//! Consensus code talks to peers only through [`Transport`]: send one
//! request frame, get one reply frame. Frames are opaque bytes.

pub mod traced;
pub mod transport;

pub use traced::TracedTransport;
pub use transport::{serve_frames, FrameHandler, TcpTransport, Transport, TransportError};

// Test support - only compiled for tests or when explicitly requested
#[cfg(any(test, feature = "test-support"))]
pub use transport::{FakeNetwork, FakeTransport, NetCall};
