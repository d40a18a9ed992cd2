use crate::{
    error::TransportFailure,
    fetcher::{FetchRequest, HttpResponse},
    types::RelayCommand,
};

/// Drives the physical (or simulated) relay outputs. Commands are fire and
/// forget; there is no acknowledgement.
pub trait RelayActuator {
    fn set_relay(&mut self, switch_index: u8, on: bool);

    fn apply(&mut self, command: &RelayCommand) {
        self.set_relay(command.switch_index, command.on);
    }
}

/// Blocking HTTP GET used by worker-thread runtimes. Any HTTP status,
/// including errors, is a successful transport result.
pub trait Transport {
    fn get(&mut self, request: &FetchRequest) -> Result<HttpResponse, TransportFailure>;
}
