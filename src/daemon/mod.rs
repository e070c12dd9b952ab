//! modeld daemon - keeps at most one llama.cpp server process alive
//!
//! # Architecture
//!
//! The daemon runs in the foreground (`modeld daemon run`) and answers
//! newline-delimited JSON requests on a local socket.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 modeld daemon                │
//! ├──────────────────────────────────────────────┤
//! │  IPC Server  │  Daemon core   │  Supervisor  │
//! │  (socket)    │  (state, lock) │  (one child) │
//! ├──────────────────────────────────────────────┤
//! │  Resolver: presets │ catalog │ puller        │
//! └──────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod core;
pub mod health;
pub mod launch;
pub mod log_buffer;
pub mod protocol;
pub mod server;
pub mod supervisor;

pub use client::DaemonClient;
pub use core::{Daemon, DaemonParts, DaemonState, Snapshot};
pub use health::{HealthProbe, HttpHealthProbe, ProbeSettings};
pub use log_buffer::LogBuffer;
pub use protocol::{Request, Response};
pub use server::{DaemonConfig, DaemonServer};
pub use supervisor::{Launcher, ProcessHandle, ServerLauncher};
