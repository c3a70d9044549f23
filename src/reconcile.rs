//! Channel reconciliation
//!
//! Merges the lineups of every tuner host into one channel list and overlays
//! guide station metadata keyed by normalized channel number.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::epg::normalize_channel_number;
use crate::models::{ChannelInfo, StationInfo};

/// Union host lineups by channel number (first seen wins), overlay station
/// names and logos, and sort by channel number.
pub fn merge_channels(
    host_channels: &[Vec<ChannelInfo>],
    stations: &HashMap<String, StationInfo>,
) -> Vec<ChannelInfo> {
    let mut merged: Vec<ChannelInfo> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for channel in host_channels.iter().flatten() {
        if seen.insert(channel.number.as_str()) {
            merged.push(channel.clone());
        }
    }

    for channel in merged.iter_mut() {
        let station = stations
            .get(&normalize_channel_number(&channel.number))
            .or_else(|| stations.get(&channel.number));
        if let Some(station) = station {
            channel.name = station.display_name().to_string();
            if station.image_url.is_some() {
                channel.image_url = station.image_url.clone();
            }
        }
    }

    merged.sort_by(|a, b| compare_channel_numbers(&a.number, &b.number));
    merged
}

/// Numeric-aware ordering: "2" < "10", "5.1" < "5.2" < "7"
pub fn compare_channel_numbers(a: &str, b: &str) -> Ordering {
    match (numeric_parts(a), numeric_parts(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

fn numeric_parts(number: &str) -> Option<Vec<u64>> {
    number
        .split(|c| c == '.' || c == '-')
        .map(|part| part.trim().parse::<u64>().ok())
        .collect()
}
