use std::collections::HashMap;

use chrono::DateTime;

use chatvault_types::api::ChannelDto;
use chatvault_types::{Channel, ChannelKind};

/// Channel id to channel lookup, built once per run from the remote listing
/// and only read afterwards.
#[derive(Debug, Default)]
pub struct ChannelDirectory {
    channels: HashMap<String, Channel>,
}

impl ChannelDirectory {
    pub fn from_listing(listing: &[ChannelDto]) -> Self {
        let channels = listing
            .iter()
            .map(|dto| (dto.id.clone(), channel_from_dto(dto)))
            .collect();
        Self { channels }
    }

    pub fn get(&self, id: &str) -> Option<&Channel> {
        self.channels.get(id)
    }

    /// Human-readable name, falling back to the id for unknown channels.
    pub fn display_name<'a>(&'a self, id: &'a str) -> &'a str {
        self.channels.get(id).map(|c| c.name.as_str()).unwrap_or(id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

pub fn channel_from_dto(dto: &ChannelDto) -> Channel {
    Channel {
        id: dto.id.clone(),
        name: dto.name.clone(),
        kind: if dto.is_private {
            ChannelKind::Private
        } else {
            ChannelKind::Public
        },
        is_archived: dto.is_archived,
        created_at: DateTime::from_timestamp(dto.created, 0).unwrap_or_default(),
        topic: dto.topic.as_ref().map(|t| t.value.clone()).unwrap_or_default(),
        purpose: dto.purpose.as_ref().map(|t| t.value.clone()).unwrap_or_default(),
    }
}
