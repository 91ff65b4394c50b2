//! Client runtime for a local OpenCode server: session lifecycle, prompts,
//! the shared event stream and exactly-once session cleanup.

pub mod classify;
pub mod cli;
pub mod client;
pub mod config;
pub mod event_bus;
pub mod events;
pub mod registry;
pub mod retry;
pub mod scope;
pub mod sse;
pub mod testing;
pub mod transport;
pub mod types;

pub use client::SessionClient;
pub use config::{ClientConfig, ConfigError, RetryConfig, StreamConfig};
pub use event_bus::{BusState, EventBus, SessionFilter, Subscription};
pub use events::{EventKind, StreamEvent};
pub use opencode_client_error::{ClientError, ErrorType, ProblemDetails};
pub use registry::{SessionRegistry, TrackedSession};
pub use scope::{ReleaseOutcome, SessionScope};
pub use transport::{HttpTransport, Transport, TransportError, TransportRequest, TransportResponse};
pub use types::*;
