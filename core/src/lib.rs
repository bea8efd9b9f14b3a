//! ZeeChat Core Library
//!
//! Client-side real-time conversation sync for one-to-one chat.
//! Provides: connection management, event normalization, the conversation
//! store, the outbound composer, and view derivation.

pub mod api;
pub mod composer;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod models;
pub mod session;
pub mod store;
pub mod view;

pub use api::{ApiClient, ChatApi};
pub use composer::OutboundComposer;
pub use config::*;
pub use connection::{ConnectionManager, ConnectionState, FrameHandler, Transport};
pub use error::*;
pub use events::{InboundEvent, OutboundEvent, ReactionChange};
pub use models::*;
pub use session::ChatSession;
pub use store::*;
pub use view::*;
