use serde::{Deserialize, Serialize};

use crate::{
    cache::ScheduleCache,
    config::ControllerConfig,
    document::ScheduleDocument,
    error::TransportFailure,
    types::UnixTime,
};

pub const CLIENT_VERSION: &str = concat!("loadctl-", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub mac: String,
    pub model: String,
    pub firmware: String,
}

impl DeviceIdentity {
    /// Normalizes `mac` to the twelve upper-case hex digits the service keys
    /// devices by, dropping `:` and `-` separators.
    pub fn new(mac: &str, model: impl Into<String>, firmware: impl Into<String>) -> Self {
        Self {
            mac: mac
                .chars()
                .filter(|c| !matches!(c, ':' | '-') && !c.is_whitespace())
                .map(|c| c.to_ascii_uppercase())
                .collect(),
            model: model.into(),
            firmware: firmware.into(),
        }
    }

    pub fn has_mac(&self) -> bool {
        !self.mac.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub id: u64,
    pub url: String,
    pub timeout_sec: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Updated { valid_until: UnixTime, channels: u32 },
    NotModified,
    Rejected { status: u16 },
    TransportError(TransportFailure),
    Malformed(String),
    /// Completion for a request that is no longer outstanding.
    Superseded,
}

impl FetchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Updated { .. } => "UPDATED",
            Self::NotModified => "NOT_MODIFIED",
            Self::Rejected { .. } => "REJECTED",
            Self::TransportError(_) => "TRANSPORT_ERROR",
            Self::Malformed(_) => "MALFORMED",
            Self::Superseded => "SUPERSEDED",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Updated {
                valid_until,
                channels,
            } => format!("schedule updated: {channels} channel(s), valid until {valid_until}"),
            Self::NotModified => "schedule not changed since last request".to_string(),
            Self::Rejected { status } => {
                format!("request rejected ({}), HTTP {status}", reject_reason(*status))
            }
            Self::TransportError(failure) => format!("request failed: {failure}"),
            Self::Malformed(reason) => format!("response body rejected: {reason}"),
            Self::Superseded => "late response for an abandoned request discarded".to_string(),
        }
    }
}

pub fn reject_reason(status: u16) -> &'static str {
    match status {
        400 => "bad request",
        425 => "requests too close together",
        429 => "rate limited",
        _ => "unexpected status",
    }
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    id: u64,
    age_cycles: u32,
}

#[derive(Debug, Clone)]
pub struct ScheduleFetcher {
    endpoint: String,
    identity: DeviceIdentity,
    timeout_sec: u32,
    cut_schedule: u32,
    json_version: u32,
    json_channel_names: bool,
    last_request: UnixTime,
    last_http_status: Option<u16>,
    last_outcome: Option<FetchOutcome>,
    next_request_id: u64,
    in_flight: Option<InFlight>,
}

impl ScheduleFetcher {
    pub fn new(config: &ControllerConfig, identity: DeviceIdentity) -> Self {
        Self {
            endpoint: config.api_endpoint.clone(),
            identity,
            timeout_sec: config.request_timeout_sec,
            cut_schedule: config.cut_schedule,
            json_version: config.json_version,
            json_channel_names: config.json_channel_names,
            last_request: 0,
            last_http_status: None,
            last_outcome: None,
            next_request_id: 1,
            in_flight: None,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn last_request(&self) -> UnixTime {
        self.last_request
    }

    pub fn last_http_status(&self) -> Option<u16> {
        self.last_http_status
    }

    pub fn last_outcome(&self) -> Option<&FetchOutcome> {
        self.last_outcome.as_ref()
    }

    pub fn in_flight(&self) -> Option<u64> {
        self.in_flight.map(|request| request.id)
    }

    pub fn request_url(&self) -> String {
        let params: [(&str, String); 8] = [
            ("device_mac", self.identity.mac.clone()),
            ("last_request", self.last_request.to_string()),
            ("script_version", CLIENT_VERSION.to_string()),
            ("client_model", self.identity.model.clone()),
            ("client_fw", self.identity.firmware.clone()),
            ("cut_schedule", self.cut_schedule.to_string()),
            ("json_version", self.json_version.to_string()),
            ("json_channel_names", self.json_channel_names.to_string()),
        ];

        let query = params
            .iter()
            .map(|(key, value)| format!("{key}={}", encode_query_value(value)))
            .collect::<Vec<_>>()
            .join("&");

        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{separator}{query}", self.endpoint)
    }

    pub fn begin(&mut self) -> FetchRequest {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        self.in_flight = Some(InFlight { id, age_cycles: 0 });

        FetchRequest {
            id,
            url: self.request_url(),
            timeout_sec: self.timeout_sec,
        }
    }

    /// Ages the outstanding request by one tick. Returns its id once it has
    /// been outstanding for `abandon_after` ticks; the request is forgotten.
    pub fn age_in_flight(&mut self, abandon_after: u32) -> Option<u64> {
        let request = self.in_flight.as_mut()?;
        request.age_cycles = request.age_cycles.saturating_add(1);
        if request.age_cycles < abandon_after {
            return None;
        }

        let id = request.id;
        self.in_flight = None;
        Some(id)
    }

    pub fn complete(
        &mut self,
        request_id: u64,
        result: Result<HttpResponse, TransportFailure>,
        cache: &mut ScheduleCache,
    ) -> FetchOutcome {
        if self.in_flight() != Some(request_id) {
            return FetchOutcome::Superseded;
        }
        self.in_flight = None;

        let outcome = match result {
            Err(failure) => FetchOutcome::TransportError(failure),
            Ok(response) => {
                self.last_http_status = Some(response.status);
                self.classify(response, cache)
            }
        };

        self.last_outcome = Some(outcome.clone());
        outcome
    }

    fn classify(&mut self, response: HttpResponse, cache: &mut ScheduleCache) -> FetchOutcome {
        match response.status {
            200 => match ScheduleDocument::from_json(&response.body) {
                Ok(document) => {
                    let metadata = document.metadata.clone();
                    self.last_request = metadata.issued_at;
                    if let Some(url) = metadata.fetch_url {
                        self.endpoint = url;
                    }
                    cache.replace(document);
                    FetchOutcome::Updated {
                        valid_until: metadata.valid_until,
                        channels: metadata.channel_count,
                    }
                }
                Err(err) => FetchOutcome::Malformed(err.to_string()),
            },
            304 => FetchOutcome::NotModified,
            status => FetchOutcome::Rejected { status },
        }
    }
}

fn encode_query_value(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => {
                use core::fmt::Write as _;
                let _ = write!(&mut encoded, "%{byte:02X}");
            }
        }
    }
    encoded
}
