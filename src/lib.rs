//! Real-time message synchronization client for a chat service.

pub mod api;
pub mod app;
pub mod error;
pub mod sync;
pub mod utils;

pub use app::AppConfig;
pub use error::{ChatError, Notice, NoticeLevel, Result};
pub use sync::connection::{ConnectionManager, ConnectionState, ReconnectPolicy};
pub use sync::session::{ChatSession, Command, SessionHandle, SessionSettings, SessionSnapshot};
