// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Transport core for an embeddable HTTP/HTTPS REST server.
//!
//! This crate owns the socket-accepting, event-multiplexing,
//! timer-managing, TLS-handshake-driving engine that sits underneath a
//! request handler. It never parses HTTP: [`handler::Handler`] receives
//! raw bytes and an opaque request handle, and the engine only cares about
//! accept/read/write/timeout/close.
//!
//! Start one with [`engine::Engine::start`], supplying a [`config::Config`]
//! and a [`handler::Handler`] implementation; stop it with
//! [`engine::Engine::shutdown`].

pub mod buffer;
pub mod config;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod handler;
pub mod io;
pub mod listener;
pub mod logging;
pub mod queue;
pub mod socket;
pub mod timer;
pub mod tls;

pub use config::{Config, ConfigBuilder, LogLevel};
pub use engine::Engine;
pub use error::{Error, Result};
pub use handler::{Connections, Handler};
