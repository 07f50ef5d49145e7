//! tether-gateway — WebSocket gateway for desktop LLM clients
//!
//! Clients open a socket under a self-chosen connection id, get
//! authenticated when the web login flow delivers a single-use token for
//! that id, then run metered completions against any configured provider.

pub mod auth;
pub mod connection;
pub mod error;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod server;

pub use auth::AuthBridge;
pub use error::{GatewayError, GatewayResult};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RequestPhase};
pub use protocol::{ClientMessage, ServerMessage};
pub use registry::{ConnectionRegistry, ConnectionSnapshot, ConnectionState};
pub use server::{GatewayServer, GatewayState, build_router};
