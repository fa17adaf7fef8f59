use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};
use ulid::{Generator, Ulid};

use crate::{
    error::Result,
    model::{unix_now, ActivityEntry, NewActivity},
    store::Store,
};

struct ActivityState {
    entries: VecDeque<ActivityEntry>,
    ids: Generator,
}

impl std::fmt::Debug for ActivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityState")
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

/// Append-only history of download lifecycle events and user actions.
///
/// Recording never fails the caller: a store error is logged and the entry
/// is kept in memory only.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    state: Arc<Mutex<ActivityState>>,
    store: Store,
    retention: usize,
}

impl ActivityLog {
    pub async fn load(store: Store, retention: usize) -> Result<Self> {
        let mut entries = VecDeque::from(store.load_activities().await?);
        while entries.len() > retention {
            if let Some(evicted) = entries.pop_front() {
                store.delete_activity(&evicted.id).await?;
            }
        }
        Ok(ActivityLog {
            state: Arc::new(Mutex::new(ActivityState {
                entries,
                ids: Generator::new(),
            })),
            store,
            retention,
        })
    }

    pub async fn record(&self, activity: NewActivity) -> ActivityEntry {
        let mut state = self.state.lock().await;
        // The generator only fails if more ids are requested within one
        // millisecond than the random part can hold.
        let id = state.ids.generate().unwrap_or_else(|_| Ulid::new());
        let entry = ActivityEntry {
            id: id.to_string(),
            timestamp: unix_now(),
            action_type: activity.action_type,
            file_name: activity.file_name,
            identifier: activity.identifier,
            status: activity.status,
            details: activity.details,
        };
        debug!("Activity {:?}: {:?}", entry.action_type, entry.details);

        state.entries.push_back(entry.clone());
        if let Err(err) = self.store.put_activity(&entry).await {
            warn!("Failed to store activity {}: {}", entry.id, err);
        }
        while state.entries.len() > self.retention {
            if let Some(evicted) = state.entries.pop_front() {
                if let Err(err) = self.store.delete_activity(&evicted.id).await {
                    warn!("Failed to evict activity {}: {}", evicted.id, err);
                }
            }
        }
        entry
    }

    /// Oldest first.
    pub async fn all(&self) -> Vec<ActivityEntry> {
        self.state.lock().await.entries.iter().cloned().collect()
    }

    /// Drop the whole history. The log starts fresh, so the clearing itself
    /// leaves no entry behind.
    pub async fn clear(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut cleared = 0;
        // An entry leaves memory only once the store has let go of it, so a
        // failed delete leaves both holding the same history.
        while let Some(id) = state.entries.front().map(|entry| entry.id.clone()) {
            self.store.delete_activity(&id).await?;
            state.entries.pop_front();
            cleared += 1;
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActionType;

    async fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("store.sqlite").display());
        (dir, Store::open(&url).await.unwrap())
    }

    #[tokio::test]
    async fn oldest_entries_are_evicted() {
        let (_dir, store) = temp_store().await;
        let log = ActivityLog::load(store.clone(), 3).await.unwrap();
        for n in 0..5 {
            log.record(NewActivity::new(ActionType::UserInteraction).details(format!("click {}", n)))
                .await;
        }

        let details = log
            .all()
            .await
            .into_iter()
            .filter_map(|e| e.details)
            .collect::<Vec<_>>();
        assert_eq!(details, vec!["click 2", "click 3", "click 4"]);
        assert_eq!(store.load_activities().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn history_survives_a_reload_and_clears_fresh() {
        let (_dir, store) = temp_store().await;
        let log = ActivityLog::load(store.clone(), 100).await.unwrap();
        log.record(NewActivity::new(ActionType::FileAdded).details("a"))
            .await;
        log.record(NewActivity::new(ActionType::FileAdded).details("b"))
            .await;

        let reloaded = ActivityLog::load(store.clone(), 100).await.unwrap();
        let entries = reloaded.all().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].details.as_deref(), Some("a"));

        assert_eq!(reloaded.clear().await.unwrap(), 2);
        assert!(reloaded.all().await.is_empty());
        assert!(store.load_activities().await.unwrap().is_empty());

        // Memory and store agree after clearing.
        let again = ActivityLog::load(store.clone(), 100).await.unwrap();
        assert!(again.all().await.is_empty());
        assert_eq!(again.clear().await.unwrap(), 0);
    }
}
