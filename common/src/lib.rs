pub mod cache;
pub mod clock;
pub mod config;
pub mod controller;
pub mod cycle;
pub mod document;
pub mod error;
pub mod fetcher;
pub mod hal;
pub mod reconciler;
pub mod types;
pub mod watchdog;

pub use cache::ScheduleCache;
pub use clock::{Clock, ClockReading};
pub use config::{ControllerConfig, RelayHardwareConfig, RuntimeConfig};
pub use controller::LoadController;
pub use cycle::{CycleScheduler, CycleState, JitterSource, RandomJitter};
pub use document::{ChannelSchedule, DocumentMetadata, ScheduleDocument, ScheduleEntry};
pub use error::{DecodeError, TransportFailure};
pub use fetcher::{DeviceIdentity, FetchOutcome, FetchRequest, HttpResponse, ScheduleFetcher};
pub use hal::{RelayActuator, Transport};
pub use reconciler::RelayReconciler;
pub use types::{ControllerAction, ControllerStatus, RelayCause, RelayCommand, UnixTime};
pub use watchdog::StalenessWatchdog;
