/// The backup pass itself.
///
/// - `normalize`: wire messages to store rows
/// - `directory`: read-only channel lookup built at startup
/// - `collector`: incremental history walk of one channel
/// - `orchestrator`: the whole run over all target channels

pub mod collector;
pub mod directory;
pub mod normalize;
pub mod orchestrator;

pub use collector::{CollectStats, MessageCollector};
pub use directory::{ChannelDirectory, channel_from_dto};
pub use normalize::{Normalized, normalize};
pub use orchestrator::{ChannelReport, Orchestrator, RunOptions, RunReport};
