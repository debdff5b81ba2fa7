//! Channel id -> ordered candidate streams
//!
//! Candidate order is first-seen order in the playlist and doubles as the
//! priority order for validation and playback failover. An index is never
//! mutated after construction; rebuild it instead.

use std::collections::{HashMap, HashSet};

use crate::models::{Channel, Stream};

#[derive(Debug, Clone, Default)]
pub struct ChannelIndex {
    channels: Vec<Channel>,
    candidates: HashMap<String, Vec<Stream>>,
}

impl ChannelIndex {
    pub fn build(channels: &[Channel], streams: &[Stream]) -> Self {
        Self::build_inner(channels, streams, None)
    }

    /// Build an index restricted to the given channel ids
    pub fn build_filtered(
        channels: &[Channel],
        streams: &[Stream],
        channel_ids: &HashSet<String>,
    ) -> Self {
        Self::build_inner(channels, streams, Some(channel_ids))
    }

    fn build_inner(
        channels: &[Channel],
        streams: &[Stream],
        only: Option<&HashSet<String>>,
    ) -> Self {
        let keep = |id: &str| only.map_or(true, |ids| ids.contains(id));

        let mut candidates: HashMap<String, Vec<Stream>> = HashMap::new();
        for stream in streams.iter().filter(|s| keep(&s.channel_id)) {
            candidates
                .entry(stream.channel_id.clone())
                .or_default()
                .push(stream.clone());
        }

        Self {
            channels: channels.iter().filter(|c| keep(&c.id)).cloned().collect(),
            candidates,
        }
    }

    /// Ordered candidate list for a channel; empty when unknown
    pub fn candidates(&self, channel_id: &str) -> &[Stream] {
        self.candidates
            .get(channel_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Channels in first-seen order
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channel(&self, channel_id: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == channel_id)
    }

    /// Look a channel up by its trimmed display name
    pub fn find_by_name(&self, name: &str) -> Option<&Channel> {
        let name = name.trim();
        self.channels.iter().find(|c| c.name == name)
    }

    /// Channels paired with their candidates, in channel order
    pub fn iter(&self) -> impl Iterator<Item = (&Channel, &[Stream])> {
        self.channels
            .iter()
            .map(move |channel| (channel, self.candidates(&channel.id)))
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn stream_count(&self) -> usize {
        self.candidates.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
