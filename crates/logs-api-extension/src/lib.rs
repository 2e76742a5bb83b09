// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lambda extension relaying the Logs API stream to a local collector.
//!
//! - [`extension_api`]: registration and the `/event/next` long poll
//! - [`logs_api`]: the one-time Logs API subscription
//! - [`listener`]: the HTTP endpoint the host pushes log batches to
//! - [`sink`]: where received batches go
//! - [`agent`]: start-up sequence, event loop and shutdown

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod config;
pub mod error;
pub mod extension_api;
mod http;
pub mod listener;
pub mod logger;
pub mod logs_api;
pub mod sink;
