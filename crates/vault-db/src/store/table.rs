//! One typed table of a vault database.

use crate::entity::Entity;
use crate::events::{ChangeKind, EventBus, VaultEvent};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Rows keyed by id. Every mutation publishes a [`VaultEvent::Changed`].
pub struct Table<T> {
    vault_id: String,
    rows: RwLock<BTreeMap<String, T>>,
    events: Arc<EventBus>,
}

impl<T: Entity> Table<T> {
    pub fn new(vault_id: impl Into<String>, events: Arc<EventBus>) -> Self {
        Self {
            vault_id: vault_id.into(),
            rows: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    pub fn name(&self) -> &'static str {
        T::KIND.table_name()
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.rows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    /// All rows ordered by id.
    pub fn all(&self) -> Vec<T> {
        self.rows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn filter(&self, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        self.rows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|row| predicate(row))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn put(&self, row: T, source: &str) {
        self.bulk_put(vec![row], source);
    }

    /// Insert or replace rows. One event per change kind.
    pub fn bulk_put(&self, rows: Vec<T>, source: &str) {
        if rows.is_empty() {
            return;
        }
        let mut created = Vec::new();
        let mut updated = Vec::new();
        {
            let mut table = self.rows.write().unwrap_or_else(|e| e.into_inner());
            for row in rows {
                let id = row.id().to_string();
                if table.insert(id.clone(), row).is_some() {
                    updated.push(id);
                } else {
                    created.push(id);
                }
            }
        }
        self.emit(ChangeKind::Created, created, source);
        self.emit(ChangeKind::Updated, updated, source);
    }

    pub fn remove(&self, id: &str, source: &str) -> Option<T> {
        self.bulk_remove(&[id.to_string()], source).pop()
    }

    /// Remove the row only if `predicate` holds for it, checked under the
    /// write lock.
    pub fn remove_if(&self, id: &str, predicate: impl FnOnce(&T) -> bool, source: &str) -> Option<T> {
        let removed = {
            let mut table = self.rows.write().unwrap_or_else(|e| e.into_inner());
            match table.get(id) {
                Some(row) if predicate(row) => table.remove(id),
                _ => None,
            }
        };
        if removed.is_some() {
            self.emit(ChangeKind::Deleted, vec![id.to_string()], source);
        }
        removed
    }

    /// Edit the row in place. `f` returns whether it changed anything;
    /// only then is an update published.
    pub fn modify(&self, id: &str, f: impl FnOnce(&mut T) -> bool, source: &str) -> bool {
        let changed = {
            let mut table = self.rows.write().unwrap_or_else(|e| e.into_inner());
            table.get_mut(id).is_some_and(f)
        };
        if changed {
            self.emit(ChangeKind::Updated, vec![id.to_string()], source);
        }
        changed
    }

    /// Remove rows, returning those that existed.
    pub fn bulk_remove(&self, ids: &[String], source: &str) -> Vec<T> {
        let removed: Vec<T> = {
            let mut table = self.rows.write().unwrap_or_else(|e| e.into_inner());
            ids.iter().filter_map(|id| table.remove(id)).collect()
        };
        let removed_ids = removed.iter().map(|row| row.id().to_string()).collect();
        self.emit(ChangeKind::Deleted, removed_ids, source);
        removed
    }

    /// Replace the contents without publishing events.
    pub(crate) fn load(&self, rows: Vec<T>) {
        let mut table = self.rows.write().unwrap_or_else(|e| e.into_inner());
        table.clear();
        for row in rows {
            table.insert(row.id().to_string(), row);
        }
    }

    fn emit(&self, change: ChangeKind, ids: Vec<String>, source: &str) {
        if ids.is_empty() {
            return;
        }
        self.events.emit(VaultEvent::Changed {
            vault_id: self.vault_id.clone(),
            table: self.name().to_string(),
            change,
            ids,
            source: source.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Task;
    use std::sync::Mutex;

    fn task(id: &str) -> Task {
        Task {
            id: id.into(),
            vault_id: "v1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_writes_publish_change_events() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = bus.subscribe(move |event| {
            if let VaultEvent::Changed {
                change, ids, source, ..
            } = event
            {
                seen_clone.lock().unwrap().push((change, ids, source));
            }
        });

        let table = Table::new("v1", bus.clone());
        table.put(task("a"), "client-1");
        table.bulk_put(vec![task("a"), task("b")], "device");
        table.remove("b", "client-1");
        table.remove("missing", "client-1");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0], (ChangeKind::Created, vec!["a".to_string()], "client-1".to_string()));
        assert_eq!(seen[1], (ChangeKind::Created, vec!["b".to_string()], "device".to_string()));
        assert_eq!(seen[2], (ChangeKind::Updated, vec!["a".to_string()], "device".to_string()));
        assert_eq!(seen[3].0, ChangeKind::Deleted);
    }

    #[test]
    fn test_conditional_remove_and_modify() {
        let table = Table::new("v1", Arc::new(EventBus::new()));
        table.put(task("a"), "test");

        assert!(table.remove_if("a", |t| t.completed, "test").is_none());
        assert!(!table.modify("a", |_| false, "test"));
        assert!(!table.modify("missing", |_| true, "test"));
        assert!(table.modify(
            "a",
            |t| {
                t.completed = true;
                true
            },
            "test"
        ));
        assert!(table.get("a").unwrap().completed);

        assert!(table.remove_if("a", |t| t.completed, "test").is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_load_is_silent() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(Mutex::new(0));
        let count_clone = count.clone();
        let _sub = bus.subscribe(move |_| *count_clone.lock().unwrap() += 1);

        let table = Table::new("v1", bus.clone());
        table.load(vec![task("b"), task("a")]);

        assert_eq!(*count.lock().unwrap(), 0);
        let ids: Vec<_> = table.all().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
