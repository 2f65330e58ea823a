//! Real-time chat core of the Pantry recipe app: one authenticated
//! Socket.IO connection per session, a typed event bus on top of it, and
//! the state the chat, inbox and recipe views keep in sync with the server.

pub mod api;
pub mod bus;
pub mod chat;
pub mod checklist;
pub mod config;
pub mod conversation;
pub mod error;
pub mod notify;
pub mod protocol;
pub mod session;
pub mod sidebar;
pub mod transport;
pub mod typing;

pub use api::ApiClient;
pub use bus::EventBus;
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use session::Session;
pub use transport::{Channel, ConnectionState, CredentialCell, Inbound};
