use std::collections::BTreeMap;

use crate::{
    document::{ChannelSchedule, ScheduleDocument},
    types::{RelayCause, RelayCommand, UnixTime},
};

/// Tracks, per switch, the timestamp of the last schedule entry or resync
/// that was applied. Watermarks survive schedule replacement and never move
/// backwards.
#[derive(Debug, Clone, Default)]
pub struct RelayReconciler {
    watermarks: BTreeMap<u8, UnixTime>,
    initialized: bool,
}

impl RelayReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn watermark(&self, switch_index: u8) -> Option<UnixTime> {
        self.watermarks.get(&switch_index).copied()
    }

    pub fn watermarks(&self) -> &BTreeMap<u8, UnixTime> {
        &self.watermarks
    }

    pub fn reconcile(&mut self, document: &ScheduleDocument, now: UnixTime) -> Vec<RelayCommand> {
        let mut commands = Vec::new();

        if !self.initialized {
            self.bootstrap(document, now, &mut commands);
            return commands;
        }

        for channel in document.channels.values() {
            self.reconcile_channel(channel, now, &mut commands);
        }

        commands
    }

    fn bootstrap(
        &mut self,
        document: &ScheduleDocument,
        now: UnixTime,
        commands: &mut Vec<RelayCommand>,
    ) {
        // Nothing to drive yet; stay in bootstrap until a document names channels.
        if document.channels.is_empty() {
            return;
        }

        for channel in document.channels.values() {
            self.apply_declared(channel, now, RelayCause::Bootstrap, commands);
        }
        self.initialized = true;
    }

    fn reconcile_channel(
        &mut self,
        channel: &ChannelSchedule,
        now: UnixTime,
        commands: &mut Vec<RelayCommand>,
    ) {
        let Some(watermark) = self.watermark(channel.switch_index) else {
            // Channel added to the account after bootstrap.
            self.apply_declared(channel, now, RelayCause::Bootstrap, commands);
            return;
        };

        if channel.settings_updated_at > watermark {
            self.apply_declared(channel, now, RelayCause::ForcedResync, commands);
            return;
        }

        // Only the newest due entry matters; older ones it supersedes are skipped.
        let due = channel
            .entries
            .iter()
            .filter(|entry| entry.timestamp <= now && entry.timestamp > watermark)
            .max_by_key(|entry| entry.timestamp);

        if let Some(entry) = due {
            commands.push(RelayCommand {
                switch_index: channel.switch_index,
                on: entry.on,
                cause: RelayCause::Scheduled(entry.timestamp),
            });
            self.advance_watermark(channel.switch_index, entry.timestamp);
        }
    }

    fn apply_declared(
        &mut self,
        channel: &ChannelSchedule,
        now: UnixTime,
        cause: RelayCause,
        commands: &mut Vec<RelayCommand>,
    ) {
        commands.push(RelayCommand {
            switch_index: channel.switch_index,
            on: channel.declared_state,
            cause,
        });
        self.advance_watermark(channel.switch_index, now);
    }

    fn advance_watermark(&mut self, switch_index: u8, timestamp: UnixTime) {
        self.watermarks
            .entry(switch_index)
            .and_modify(|current| *current = (*current).max(timestamp))
            .or_insert(timestamp);
    }
}
