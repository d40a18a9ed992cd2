use std::collections::{btree_map::Entry, BTreeMap};

use serde::{Deserialize, Deserializer, Serialize};

use crate::{error::DecodeError, types::UnixTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScheduleEntry {
    pub timestamp: UnixTime,
    pub on: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSchedule {
    #[serde(rename = "switchIndex")]
    pub switch_index: u8,
    #[serde(rename = "declaredState")]
    pub declared_state: bool,
    #[serde(rename = "settingsUpdatedAt")]
    pub settings_updated_at: UnixTime,
    pub entries: Vec<ScheduleEntry>,
}

impl ChannelSchedule {
    pub fn new(
        switch_index: u8,
        declared_state: bool,
        settings_updated_at: UnixTime,
        mut entries: Vec<ScheduleEntry>,
    ) -> Self {
        entries.sort_by_key(|entry| entry.timestamp);
        Self {
            switch_index,
            declared_state,
            settings_updated_at,
            entries,
        }
    }

    pub fn next_entry_after(&self, now: UnixTime) -> Option<&ScheduleEntry> {
        self.entries.iter().find(|entry| entry.timestamp > now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentMetadata {
    #[serde(rename = "channelCount")]
    pub channel_count: u32,
    #[serde(rename = "issuedAt")]
    pub issued_at: UnixTime,
    #[serde(rename = "validUntil")]
    pub valid_until: UnixTime,
    #[serde(rename = "fetchUrl")]
    pub fetch_url: Option<String>,
}

/// A complete server-issued schedule. Channels are keyed by 0-based switch
/// index so iteration order never depends on the order of JSON keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleDocument {
    pub metadata: DocumentMetadata,
    pub channels: BTreeMap<u8, ChannelSchedule>,
}

impl ScheduleDocument {
    pub fn from_json(body: &[u8]) -> Result<Self, DecodeError> {
        let wire: WireDocument = serde_json::from_slice(body)?;
        Self::try_from(wire)
    }

    pub fn channel(&self, switch_index: u8) -> Option<&ChannelSchedule> {
        self.channels.get(&switch_index)
    }
}

// Server output is produced by PHP: empty maps arrive as `[]` and some
// integers are quoted. Anything beyond those two quirks is rejected.

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireCollection<T> {
    Keyed(BTreeMap<String, T>),
    Listed(Vec<T>),
}

impl<T> WireCollection<T> {
    fn into_values(self) -> Vec<T> {
        match self {
            Self::Keyed(map) => map.into_values().collect(),
            Self::Listed(list) => list,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LenientInt {
    Number(i64),
    Text(String),
}

fn lenient_int<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match LenientInt::deserialize(deserializer)? {
        LenientInt::Number(value) => Ok(value),
        LenientInt::Text(text) => text
            .trim()
            .parse::<i64>()
            .map_err(|err| serde::de::Error::custom(format!("`{text}` is not an integer: {err}"))),
    }
}

#[derive(Debug, Deserialize)]
struct WireMetadata {
    #[serde(deserialize_with = "lenient_int")]
    channels: i64,
    #[serde(deserialize_with = "lenient_int")]
    timestamp: i64,
    #[serde(deserialize_with = "lenient_int")]
    valid_until: i64,
    #[serde(default)]
    fetch_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireEntry {
    #[serde(deserialize_with = "lenient_int")]
    timestamp: i64,
    #[serde(deserialize_with = "lenient_int")]
    state: i64,
}

#[derive(Debug, Deserialize)]
struct WireChannel {
    #[serde(deserialize_with = "lenient_int")]
    id: i64,
    #[serde(deserialize_with = "lenient_int")]
    state: i64,
    #[serde(deserialize_with = "lenient_int")]
    updated: i64,
    schedules: WireCollection<WireEntry>,
}

#[derive(Debug, Deserialize)]
struct WireDocument {
    metadata: WireMetadata,
    controls: WireCollection<WireChannel>,
}

fn decode_state(switch_index: u8, value: i64) -> Result<bool, DecodeError> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(DecodeError::InvalidState {
            switch_index,
            value,
        }),
    }
}

impl TryFrom<WireDocument> for ScheduleDocument {
    type Error = DecodeError;

    fn try_from(wire: WireDocument) -> Result<Self, Self::Error> {
        let channel_count =
            u32::try_from(wire.metadata.channels).map_err(|_| DecodeError::InvalidMetadata {
                field: "channels",
                value: wire.metadata.channels,
            })?;

        let metadata = DocumentMetadata {
            channel_count,
            issued_at: wire.metadata.timestamp,
            valid_until: wire.metadata.valid_until,
            fetch_url: wire
                .metadata
                .fetch_url
                .map(|url| url.trim().to_string())
                .filter(|url| !url.is_empty()),
        };

        let mut channels = BTreeMap::new();
        for channel in wire.controls.into_values() {
            // Server ids are 1-based.
            let switch_index = channel
                .id
                .checked_sub(1)
                .and_then(|index| u8::try_from(index).ok())
                .ok_or(DecodeError::InvalidSwitchId(channel.id))?;
            let declared_state = decode_state(switch_index, channel.state)?;
            let entries = channel
                .schedules
                .into_values()
                .into_iter()
                .map(|entry| {
                    Ok(ScheduleEntry {
                        timestamp: entry.timestamp,
                        on: decode_state(switch_index, entry.state)?,
                    })
                })
                .collect::<Result<Vec<_>, DecodeError>>()?;

            match channels.entry(switch_index) {
                Entry::Occupied(_) => return Err(DecodeError::DuplicateSwitch(switch_index)),
                Entry::Vacant(slot) => {
                    slot.insert(ChannelSchedule::new(
                        switch_index,
                        declared_state,
                        channel.updated,
                        entries,
                    ));
                }
            }
        }

        Ok(Self { metadata, channels })
    }
}
