use std::sync::Arc;

use crate::document::ScheduleDocument;

/// Holds the live schedule. Replacement swaps the whole `Arc`, so a reader
/// holding a snapshot keeps a consistent document across a replacement.
#[derive(Debug, Clone, Default)]
pub struct ScheduleCache {
    current: Option<Arc<ScheduleDocument>>,
}

impl ScheduleCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn is_loaded(&self) -> bool {
        self.current.is_some()
    }

    pub fn snapshot(&self) -> Option<Arc<ScheduleDocument>> {
        self.current.clone()
    }

    pub fn document(&self) -> Option<&ScheduleDocument> {
        self.current.as_deref()
    }

    pub fn replace(&mut self, document: ScheduleDocument) -> Option<Arc<ScheduleDocument>> {
        self.current.replace(Arc::new(document))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::document::{ChannelSchedule, DocumentMetadata, ScheduleEntry};

    fn document(issued_at: i64, declared_state: bool) -> ScheduleDocument {
        let mut channels = BTreeMap::new();
        channels.insert(
            0,
            ChannelSchedule::new(
                0,
                declared_state,
                issued_at,
                vec![ScheduleEntry {
                    timestamp: issued_at + 60,
                    on: !declared_state,
                }],
            ),
        );
        ScheduleDocument {
            metadata: DocumentMetadata {
                channel_count: 1,
                issued_at,
                valid_until: issued_at + 3_600,
                fetch_url: None,
            },
            channels,
        }
    }

    #[test]
    fn snapshot_survives_replacement_unchanged() {
        let mut cache = ScheduleCache::new();
        assert!(!cache.is_loaded());

        cache.replace(document(1_000, true));
        let before = cache.snapshot().unwrap();

        let previous = cache.replace(document(2_000, false)).unwrap();
        let after = cache.snapshot().unwrap();

        assert_eq!(*before, document(1_000, true));
        assert!(Arc::ptr_eq(&before, &previous));
        assert_eq!(*after, document(2_000, false));
        assert_eq!(after.metadata.valid_until, 5_600);
        assert!(after.channel(0).map(|c| !c.declared_state).unwrap());
    }
}
