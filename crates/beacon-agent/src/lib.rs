//! In-process capture agent for Beacon.
//!
//! The agent intercepts diagnostics inside a host program and forwards them
//! to a Beacon gateway over a websocket:
//!
//! | Source                      | Event kind           | Hook                                  |
//! |-----------------------------|----------------------|---------------------------------------|
//! | console calls               | `console`            | [`Console`]                           |
//! | `tracing` events            | `console`            | [`CaptureLayer`]                      |
//! | panics                      | `error`              | [`CaptureAgent::install_panic_hook`]  |
//! | caught errors               | `error`              | [`CaptureAgent::report_error`]        |
//! | failed HTTP calls           | `error`              | [`CaptureAgent::observe_response`]    |
//! | tasks that end in `Err`     | `unhandledRejection` | [`CaptureAgent::supervise`]           |
//!
//! Interception never changes the host's behavior: console output is still
//! printed, results are passed through, and the previous panic hook still
//! runs. While the gateway is unreachable, events wait in a bounded queue
//! (oldest dropped first) and are flushed in order on reconnect.
//!
//! ```ignore
//! let agent = CaptureAgent::start(AgentConfig::new("ws://127.0.0.1:3000", "web".parse()?))?;
//! agent.install_panic_hook();
//! agent.console().error(&["Cannot read property 'x' of null".into()]);
//! ```

mod capture;
mod config;
mod error;
mod layer;
mod link;
mod outbox;
pub mod serialize;

pub use capture::{CaptureAgent, Console};
pub use config::{AgentConfig, BackoffPolicy};
pub use error::AgentError;
pub use layer::CaptureLayer;
pub use link::{ConnectionState, Delivery};
pub use serialize::{Arg, ErrorInfo};
