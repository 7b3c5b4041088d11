use thiserror::Error;

/// A write was rejected because a row it references does not exist.
///
/// Returned (wrapped in `anyhow::Error`) before anything is inserted, so the
/// caller can tell a referential rejection apart from a storage failure with
/// `err.downcast_ref::<ReferentialError>()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferentialError {
    #[error("message {message_id} references unknown author {author_id}")]
    UnknownAuthor { message_id: String, author_id: String },

    #[error("message {message_id} references unknown channel {channel_id}")]
    UnknownChannel { message_id: String, channel_id: String },
}
