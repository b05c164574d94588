//! Slack interface for Dona.
//!
//! - **Events** (`events`) - Socket Mode envelopes normalized into `InboundEvent`
//! - **Middleware** (`middleware`) - correlation, context, rate limit and audit
//!   stages, then dispatch; the ack always goes out before any handler runs
//! - **Commands** (`commands`) - router, suggestions and the bilingual
//!   sub-action grammar
//! - **Handlers** (`handlers`) - `/dona`, `/dona-task`, `/dona-time` and friends
//! - **Block Kit** (`blocks`) - typed message builders
//! - **Socket Mode** (`socket`) - transport trait and the reconnecting runner
//!
//! # Architecture
//!
//! ```text
//! Slack → SocketModeRunner → MiddlewareChain → CommandRouter → Handlers
//!                                  ↓                              ↓
//!                             ack + audit            lifecycle managers / agent
//! ```

pub mod blocks;
pub mod commands;
pub mod events;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod socket;

pub use blocks::{MessageBuilder, MessageTemplate};
pub use commands::{CommandHandler, CommandRouter, RoutingContext};
pub use events::{parse_envelope, InboundEvent, SlackEnvelope};
pub use handlers::{build_router, Services};
pub use metrics::RequestMetrics;
pub use middleware::{ChainSettings, EventResponder, MiddlewareChain, Outcome};
pub use socket::{NoopSocketTransport, ReconnectPolicy, SocketModeRunner, SocketTransport};
