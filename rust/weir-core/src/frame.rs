//! Frames: ordered channel keys paired with their sample series.

use serde::{Deserialize, Serialize};

use crate::series::Series;

/// Identifies a cluster channel.
pub type ChannelKey = u32;

/// A set of channels and their parallel sample series.
///
/// `channels[i]` always describes `series[i]`. Read tasks build a frame once
/// with one slot per configured channel plus one per referenced index
/// channel, then clear and rewrite the series on every cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    channels: Vec<ChannelKey>,
    series: Vec<Series>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self { channels: Vec::with_capacity(cap), series: Vec::with_capacity(cap) }
    }

    /// A frame holding a single channel's series.
    pub fn single(key: ChannelKey, series: Series) -> Self {
        Self { channels: vec![key], series: vec![series] }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// True when no slot carries any samples.
    pub fn has_no_samples(&self) -> bool {
        self.series.iter().all(|s| s.is_empty())
    }

    pub fn push(&mut self, key: ChannelKey, series: Series) {
        self.channels.push(key);
        self.series.push(series);
    }

    pub fn contains(&self, key: ChannelKey) -> bool {
        self.channels.contains(&key)
    }

    pub fn keys(&self) -> &[ChannelKey] {
        &self.channels
    }

    pub fn get(&self, key: ChannelKey) -> Option<&Series> {
        self.channels.iter().position(|k| *k == key).map(|i| &self.series[i])
    }

    pub fn get_mut(&mut self, key: ChannelKey) -> Option<&mut Series> {
        let i = self.channels.iter().position(|k| *k == key)?;
        Some(&mut self.series[i])
    }

    pub fn series_at(&self, i: usize) -> Option<&Series> {
        self.series.get(i)
    }

    pub fn series_at_mut(&mut self, i: usize) -> Option<&mut Series> {
        self.series.get_mut(i)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChannelKey, &Series)> {
        self.channels.iter().copied().zip(self.series.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ChannelKey, &mut Series)> {
        self.channels.iter().copied().zip(self.series.iter_mut())
    }

    /// Removes every slot. Prefer [`Frame::clear_data`] on reused frames.
    pub fn clear(&mut self) {
        self.channels.clear();
        self.series.clear();
    }

    /// Clears every series in place, keeping keys and buffer capacity.
    pub fn clear_data(&mut self) {
        for s in &mut self.series {
            s.clear();
        }
    }
}
