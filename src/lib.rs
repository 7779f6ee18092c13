//! HTTP exchange channel core.
//!
//! The per-connection state machine that mediates between a passive
//! byte-oriented parser/transport and an active application handler,
//! driving a single HTTP exchange from request-line arrival through
//! response completion -- including synchronous, asynchronous (suspended),
//! and error dispatches. Byte-level parsing/encoding, TLS, and routing are
//! out of scope; see [`traits`] for the interfaces this core consumes from
//! those collaborators.
#![forbid(unsafe_code)]

pub mod body;
pub mod channel;
pub mod config;
pub mod date;
pub mod error;
pub mod http;
pub mod input;
pub mod listener;
pub mod output;
pub mod request;
pub mod response;
pub mod runtime;
pub mod state;
pub mod traits;

pub use crate::channel::{Channel, DispatcherType, Exchange};
pub use crate::config::ChannelConfig;
pub use crate::error::{ChannelError, FailureClass};
pub use crate::listener::{Listener, ListenerFanout, Phase};
pub use crate::request::RequestMeta;
pub use crate::response::ResponseMeta;
pub use crate::state::{Action, StateMachine};
