use serde::Serialize;

use crate::fetcher::FetchRequest;

/// Seconds since the Unix epoch, as used on the wire and by the device clock.
pub type UnixTime = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayCause {
    Bootstrap,
    ForcedResync,
    Scheduled(UnixTime),
}

impl RelayCause {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::ForcedResync => "forced-resync",
            Self::Scheduled(_) => "scheduled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayCommand {
    pub switch_index: u8,
    pub on: bool,
    pub cause: RelayCause,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerAction {
    Fetch(FetchRequest),
    AbandonFetch { request_id: u64 },
    SetRelay(RelayCommand),
    Reboot { valid_until: UnixTime },
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    #[serde(rename = "switchIndex")]
    pub switch_index: u8,
    pub watermark: Option<UnixTime>,
    #[serde(rename = "relayOn")]
    pub relay_on: Option<bool>,
    #[serde(rename = "nextChange")]
    pub next_change: Option<UnixTime>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    #[serde(rename = "nowEpoch")]
    pub now_epoch: Option<UnixTime>,
    #[serde(rename = "localTime")]
    pub local_time: Option<String>,
    #[serde(rename = "scheduleLoaded")]
    pub schedule_loaded: bool,
    #[serde(rename = "cyclesSinceFetch")]
    pub cycles_since_fetch: u32,
    #[serde(rename = "cyclesUntilFetch")]
    pub cycles_until_fetch: u32,
    #[serde(rename = "fetchInFlight")]
    pub fetch_in_flight: bool,
    #[serde(rename = "lastHttpStatus")]
    pub last_http_status: Option<u16>,
    #[serde(rename = "lastOutcome")]
    pub last_outcome: Option<&'static str>,
    #[serde(rename = "lastRequest")]
    pub last_request: UnixTime,
    #[serde(rename = "validUntil")]
    pub valid_until: Option<UnixTime>,
    #[serde(rename = "channelCount")]
    pub channel_count: Option<u32>,
    pub endpoint: String,
    #[serde(rename = "watchdogTripped")]
    pub watchdog_tripped: bool,
    #[serde(rename = "reconcilerInitialized")]
    pub reconciler_initialized: bool,
    pub channels: Vec<ChannelStatus>,
}
