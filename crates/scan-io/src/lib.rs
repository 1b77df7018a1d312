pub mod auth;
pub mod bridge;
pub mod metrics;
pub mod protocol;

pub use auth::{AuthConfig, AuthError, TokenClaims, TokenValidator};
pub use bridge::{Bridge, BridgeConfig, BridgeContext, CommandHook, CommandRecord};
pub use metrics::{init_metrics, serve_metrics};
pub use protocol::{IncomingMessage, ProtocolVersion, ReplyMsg, StateMsg};
