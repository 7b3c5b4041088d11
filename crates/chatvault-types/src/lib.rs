/// Shared types for the chatvault workspace.
///
/// - `models`: normalized rows as the store and the pipeline see them
/// - `api`: wire DTOs of the remote conversation API
/// - `logging`: the injectable pipeline logger

pub mod api;
pub mod logging;
pub mod models;

pub use logging::{MemoryLogger, NullLogger, SyncEvent, SyncLog, SyncLogger, TracingLogger};
pub use models::{Channel, ChannelKind, FileRecord, FileRef, Message, User};
