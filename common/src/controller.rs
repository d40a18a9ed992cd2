use std::{collections::BTreeMap, sync::Arc};

use crate::{
    cache::ScheduleCache,
    clock::ClockReading,
    config::ControllerConfig,
    cycle::{CycleScheduler, CycleState, JitterSource},
    document::ScheduleDocument,
    error::TransportFailure,
    fetcher::{DeviceIdentity, FetchOutcome, HttpResponse, ScheduleFetcher},
    reconciler::RelayReconciler,
    types::{ChannelStatus, ControllerAction, ControllerStatus},
    watchdog::StalenessWatchdog,
};

/// Owns every piece of controller state. The driving loop calls [`tick`] on
/// a fixed period and feeds fetch completions back through
/// [`complete_fetch`]; both return what the runtime has to carry out.
///
/// [`tick`]: LoadController::tick
/// [`complete_fetch`]: LoadController::complete_fetch
#[derive(Debug)]
pub struct LoadController<J> {
    config: ControllerConfig,
    cycle: CycleScheduler<J>,
    cache: ScheduleCache,
    fetcher: ScheduleFetcher,
    reconciler: RelayReconciler,
    watchdog: StalenessWatchdog,
    last_reading: Option<ClockReading>,
    relay_states: BTreeMap<u8, bool>,
}

impl<J: JitterSource> LoadController<J> {
    pub fn new(mut config: ControllerConfig, identity: DeviceIdentity, jitter: J) -> Self {
        config.sanitize();
        Self {
            cycle: CycleScheduler::new(config.fetch_jitter_base, config.fetch_jitter_spread, jitter),
            fetcher: ScheduleFetcher::new(&config, identity),
            cache: ScheduleCache::new(),
            reconciler: RelayReconciler::new(),
            watchdog: StalenessWatchdog::new(),
            last_reading: None,
            relay_states: BTreeMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn cycle_state(&self) -> CycleState {
        self.cycle.state()
    }

    pub fn document(&self) -> Option<Arc<ScheduleDocument>> {
        self.cache.snapshot()
    }

    pub fn tick(&mut self, reading: ClockReading) -> Vec<ControllerAction> {
        let mut actions = Vec::new();
        self.last_reading = Some(reading);

        if let Some(request_id) = self.fetcher.age_in_flight(self.config.fetch_abandon_cycles) {
            actions.push(ControllerAction::AbandonFetch { request_id });
        }

        if self.cycle.advance() && self.fetcher.in_flight().is_none() {
            actions.push(ControllerAction::Fetch(self.fetcher.begin()));
        }

        let loaded = self.cycle.state().schedule_loaded;
        if loaded {
            if let Some(document) = self.cache.snapshot() {
                for command in self.reconciler.reconcile(&document, reading.unix) {
                    self.relay_states.insert(command.switch_index, command.on);
                    actions.push(ControllerAction::SetRelay(command));
                }
            }
        }

        let valid_until = self
            .cache
            .document()
            .map(|document| document.metadata.valid_until);
        if self.watchdog.check(reading.unix, loaded, valid_until) {
            if let Some(valid_until) = valid_until {
                actions.push(ControllerAction::Reboot { valid_until });
            }
        }

        actions
    }

    pub fn complete_fetch(
        &mut self,
        request_id: u64,
        result: Result<HttpResponse, TransportFailure>,
    ) -> FetchOutcome {
        let outcome = self.fetcher.complete(request_id, result, &mut self.cache);
        if outcome == FetchOutcome::Superseded {
            return outcome;
        }

        if matches!(outcome, FetchOutcome::Updated { .. }) {
            self.cycle.mark_loaded();
        }
        self.cycle.on_fetch_completed();
        outcome
    }

    pub fn status(&self) -> ControllerStatus {
        let cycle = self.cycle.state();
        let document = self.cache.document();

        let mut indices: Vec<u8> = self.reconciler.watermarks().keys().copied().collect();
        if let Some(document) = document {
            indices.extend(document.channels.keys().copied());
        }
        indices.sort_unstable();
        indices.dedup();

        ControllerStatus {
            now_epoch: self.last_reading.map(|reading| reading.unix),
            local_time: self.last_reading.map(|reading| reading.local_time()),
            schedule_loaded: cycle.schedule_loaded,
            cycles_since_fetch: cycle.cycles_since_fetch,
            cycles_until_fetch: cycle.cycles_until_fetch,
            fetch_in_flight: self.fetcher.in_flight().is_some(),
            last_http_status: self.fetcher.last_http_status(),
            last_outcome: self.fetcher.last_outcome().map(FetchOutcome::as_str),
            last_request: self.fetcher.last_request(),
            valid_until: document.map(|document| document.metadata.valid_until),
            channel_count: document.map(|document| document.metadata.channel_count),
            endpoint: self.fetcher.endpoint().to_string(),
            watchdog_tripped: self.watchdog.is_tripped(),
            reconciler_initialized: self.reconciler.is_initialized(),
            channels: indices
                .into_iter()
                .map(|switch_index| ChannelStatus {
                    switch_index,
                    watermark: self.reconciler.watermark(switch_index),
                    relay_on: self.relay_states.get(&switch_index).copied(),
                    next_change: document
                        .zip(self.last_reading)
                        .and_then(|(document, reading)| {
                            document.channel(switch_index)?.next_entry_after(reading.unix)
                        })
                        .map(|entry| entry.timestamp),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cycle::tests::FixedJitter,
        types::{RelayCause, RelayCommand},
    };
    use pretty_assertions::assert_eq;

    const START: i64 = 1_767_600_000;

    fn body(valid_until: i64, updated: i64, entries: &[(i64, u8)]) -> Vec<u8> {
        let schedules = entries
            .iter()
            .enumerate()
            .map(|(key, (timestamp, state))| {
                format!(r#""{key}": {{"timestamp": {timestamp}, "state": {state}}}"#)
            })
            .collect::<Vec<_>>()
            .join(",");
        format!(
            r#"{{"metadata": {{"channels": 1, "timestamp": {START}, "valid_until": {valid_until}}},
                "controls": {{"ch1": {{"id": 1, "state": 1, "updated": {updated},
                                      "schedules": {{{schedules}}}}}}}}}"#
        )
        .into_bytes()
    }

    fn reading(unix: i64) -> ClockReading {
        ClockReading {
            unix,
            hour: 12,
            minute: 0,
        }
    }

    fn controller(draws: &[u32]) -> LoadController<FixedJitter> {
        LoadController::new(
            ControllerConfig::default(),
            DeviceIdentity {
                mac: "AABBCCDDEEFF".to_string(),
                model: "host".to_string(),
                firmware: "test".to_string(),
            },
            FixedJitter::new(draws),
        )
    }

    fn fetch_id(actions: &[ControllerAction]) -> Option<u64> {
        actions.iter().find_map(|action| match action {
            ControllerAction::Fetch(request) => Some(request.id),
            _ => None,
        })
    }

    fn relay_commands(actions: &[ControllerAction]) -> Vec<RelayCommand> {
        actions
            .iter()
            .filter_map(|action| match action {
                ControllerAction::SetRelay(command) => Some(*command),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn first_tick_fetches_and_nothing_else() {
        let mut controller = controller(&[]);

        let actions = controller.tick(reading(START));

        assert_eq!(actions.len(), 1);
        assert!(fetch_id(&actions).is_some());
        assert!(!controller.cycle_state().schedule_loaded);
    }

    #[test]
    fn does_not_stack_fetches_while_one_is_outstanding() {
        let mut controller = controller(&[]);

        assert!(fetch_id(&controller.tick(reading(START))).is_some());
        assert!(fetch_id(&controller.tick(reading(START + 15))).is_none());
        assert!(fetch_id(&controller.tick(reading(START + 30))).is_none());
    }

    #[test]
    fn hung_fetch_is_abandoned_and_reissued() {
        let mut controller = controller(&[]);
        let first = fetch_id(&controller.tick(reading(START))).unwrap();

        for step in 1..4 {
            controller.tick(reading(START + step * 15));
        }
        let actions = controller.tick(reading(START + 60));

        assert!(actions.contains(&ControllerAction::AbandonFetch { request_id: first }));
        let second = fetch_id(&actions).unwrap();
        assert_ne!(first, second);

        assert_eq!(
            controller.complete_fetch(first, Ok(HttpResponse {
                status: 200,
                body: body(START + 3_600, START - 100, &[]),
            })),
            FetchOutcome::Superseded
        );
        assert!(controller.document().is_none());
    }

    #[test]
    fn successful_fetch_bootstraps_relays_on_next_tick() {
        let mut controller = controller(&[2]);
        let id = fetch_id(&controller.tick(reading(START))).unwrap();

        let outcome = controller.complete_fetch(
            id,
            Ok(HttpResponse {
                status: 200,
                body: body(START + 86_400, START - 100, &[(START + 60, 0)]),
            }),
        );
        assert!(matches!(outcome, FetchOutcome::Updated { .. }));
        assert_eq!(controller.cycle_state().cycles_since_fetch, 0);
        assert_eq!(controller.cycle_state().cycles_until_fetch, 20);

        let actions = controller.tick(reading(START + 15));
        assert_eq!(
            relay_commands(&actions),
            vec![RelayCommand {
                switch_index: 0,
                on: true,
                cause: RelayCause::Bootstrap
            }]
        );
        assert!(fetch_id(&actions).is_none());

        assert!(relay_commands(&controller.tick(reading(START + 30))).is_empty());

        let actions = controller.tick(reading(START + 60));
        assert_eq!(
            relay_commands(&actions),
            vec![RelayCommand {
                switch_index: 0,
                on: false,
                cause: RelayCause::Scheduled(START + 60)
            }]
        );
    }

    #[test]
    fn counters_reset_on_completion_not_on_issue() {
        let mut controller = controller(&[0, 1]);
        let id = fetch_id(&controller.tick(reading(START))).unwrap();
        controller.complete_fetch(
            id,
            Ok(HttpResponse {
                status: 200,
                body: body(START + 86_400, START - 100, &[]),
            }),
        );
        assert_eq!(controller.cycle_state().cycles_until_fetch, 18);

        let mut now = START;
        let mut refetch = None;
        for _ in 0..18 {
            now += 15;
            refetch = fetch_id(&controller.tick(reading(now)));
        }
        let refetch = refetch.expect("fetch due after 18 cycles");
        assert_eq!(controller.cycle_state().cycles_since_fetch, 18);

        now += 15;
        controller.tick(reading(now));
        assert_eq!(controller.cycle_state().cycles_since_fetch, 19);

        let outcome = controller.complete_fetch(
            refetch,
            Ok(HttpResponse {
                status: 304,
                body: Vec::new(),
            }),
        );
        assert_eq!(outcome, FetchOutcome::NotModified);
        assert_eq!(controller.cycle_state().cycles_since_fetch, 0);
        assert_eq!(controller.cycle_state().cycles_until_fetch, 19);
    }

    #[test]
    fn failed_fetch_before_first_load_retries_next_tick() {
        let mut controller = controller(&[]);
        let id = fetch_id(&controller.tick(reading(START))).unwrap();

        let outcome = controller.complete_fetch(id, Err(TransportFailure::new(-1, "dns")));
        assert!(matches!(outcome, FetchOutcome::TransportError(_)));
        assert!(!controller.cycle_state().schedule_loaded);

        assert!(fetch_id(&controller.tick(reading(START + 15))).is_some());
    }

    #[test]
    fn reboots_once_when_schedule_runs_out() {
        let mut controller = controller(&[]);
        let id = fetch_id(&controller.tick(reading(START))).unwrap();
        controller.complete_fetch(
            id,
            Ok(HttpResponse {
                status: 200,
                body: body(START + 30, START - 100, &[]),
            }),
        );

        let reboots = |actions: &[ControllerAction]| {
            actions
                .iter()
                .filter(|action| matches!(action, ControllerAction::Reboot { .. }))
                .count()
        };

        assert_eq!(reboots(&controller.tick(reading(START + 15))), 0);
        let actions = controller.tick(reading(START + 30));
        assert_eq!(
            actions.last(),
            Some(&ControllerAction::Reboot {
                valid_until: START + 30
            })
        );
        assert!(controller.status().watchdog_tripped);
        assert_eq!(reboots(&controller.tick(reading(START + 45))), 0);
    }

    #[test]
    fn failed_refresh_resets_counters_and_keeps_document() {
        let mut controller = controller(&[]);
        let id = fetch_id(&controller.tick(reading(START))).unwrap();
        controller.complete_fetch(
            id,
            Ok(HttpResponse {
                status: 200,
                body: body(START + 86_400, START - 100, &[]),
            }),
        );
        let loaded = controller.document().unwrap();

        let mut now = START;
        let mut next_fetch = |controller: &mut LoadController<FixedJitter>| loop {
            now += 15;
            if let Some(id) = fetch_id(&controller.tick(reading(now))) {
                return id;
            }
        };

        let rejected = next_fetch(&mut controller);
        assert_eq!(controller.cycle_state().cycles_since_fetch, 18);
        let outcome = controller.complete_fetch(
            rejected,
            Ok(HttpResponse {
                status: 429,
                body: Vec::new(),
            }),
        );
        assert_eq!(outcome, FetchOutcome::Rejected { status: 429 });
        assert_eq!(controller.cycle_state().cycles_since_fetch, 0);
        assert!(Arc::ptr_eq(&loaded, &controller.document().unwrap()));

        let failed = next_fetch(&mut controller);
        let outcome = controller.complete_fetch(failed, Err(TransportFailure::new(-1, "reset")));
        assert!(matches!(outcome, FetchOutcome::TransportError(_)));
        assert_eq!(controller.cycle_state().cycles_since_fetch, 0);
        assert!(controller.cycle_state().schedule_loaded);
        assert!(Arc::ptr_eq(&loaded, &controller.document().unwrap()));
    }

    #[test]
    fn status_reports_channels_and_fetch_state() {
        let mut controller = controller(&[1]);
        let id = fetch_id(&controller.tick(reading(START))).unwrap();
        controller.complete_fetch(
            id,
            Ok(HttpResponse {
                status: 200,
                body: body(START + 600, START - 100, &[]),
            }),
        );
        controller.tick(reading(START + 15));

        let status = controller.status();

        assert!(status.schedule_loaded);
        assert!(status.reconciler_initialized);
        assert!(!status.fetch_in_flight);
        assert_eq!(status.last_http_status, Some(200));
        assert_eq!(status.last_outcome, Some("UPDATED"));
        assert!(!status.watchdog_tripped);
        assert_eq!(status.valid_until, Some(START + 600));
        assert_eq!(status.channels.len(), 1);
        assert_eq!(status.channels[0].watermark, Some(START + 15));
        assert_eq!(status.channels[0].relay_on, Some(true));
        assert_eq!(status.channels[0].next_change, None);
        assert_eq!(status.local_time.as_deref(), Some("12:00"));
    }
}
