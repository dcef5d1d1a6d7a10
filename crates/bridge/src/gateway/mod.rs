// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! GW Session: authenticated TLS connection to the gateway — connect,
//! discovery, command dispatch, keepalive, reconnect.

pub mod protocol;
pub mod session;
mod tls;

pub use session::{GwSession, SessionEvent, SessionState};
