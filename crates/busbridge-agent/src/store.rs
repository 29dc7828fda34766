//! Durable mapping table of one bridge.
//!
//! Every mutation is written through to `SQLite` and then published on a
//! watch channel, which running adapters use to reload their mapping set
//! before the next poll tick or frame.

use busbridge_core::{
    find_duplicate_routes, generate_id, BusKind, Mapping, MappingId, MappingSet, ValidationError,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

use crate::persistence::{BridgeSettings, SqliteStore};

/// Mapping store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No mapping with this id
    #[error("mapping '{0}' not found")]
    NotFound(String),
    /// A mapping with this id already exists
    #[error("mapping '{0}' already exists")]
    DuplicateId(String),
    /// Field rule violation
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Storage failure
    #[error("database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Mapping table of one bridge.
pub struct MappingStore {
    bus: BusKind,
    db: Arc<SqliteStore>,
    /// Mappings in insertion order; writers hold this while touching the db
    mappings: Mutex<Vec<Mapping>>,
    tx: watch::Sender<MappingSet>,
}

impl MappingStore {
    /// Load the mappings of the `bus` bridge.
    ///
    /// # Errors
    ///
    /// Returns error if the table cannot be read or holds a corrupt row.
    pub fn open(bus: BusKind, db: Arc<SqliteStore>) -> Result<Self, StoreError> {
        let rows = db.load_mappings(&bus.to_string())?;
        let mut mappings = Vec::with_capacity(rows.len());
        for row in rows {
            let mapping: Mapping = serde_json::from_str(&row.body)
                .map_err(|e| StoreError::Database(format!("corrupt mapping '{}': {e}", row.id)))?;
            mappings.push(mapping);
        }

        tracing::info!(bridge = %bus, count = mappings.len(), "Loaded mappings");

        let (tx, _) = watch::channel(Arc::new(mappings.clone()));
        Ok(Self {
            bus,
            db,
            mappings: Mutex::new(mappings),
            tx,
        })
    }

    /// The bus of this bridge.
    #[must_use]
    pub fn bus(&self) -> BusKind {
        self.bus
    }

    /// Validate and append a mapping. An empty id is replaced by a fresh one.
    ///
    /// # Errors
    ///
    /// Returns error if the mapping is invalid, belongs to the other bus,
    /// reuses an existing id, or cannot be written.
    pub fn create(&self, mut mapping: Mapping) -> Result<MappingId, StoreError> {
        self.check(&mapping)?;

        let mut mappings = self.mappings.lock();
        if mapping.id.is_empty() {
            mapping.id = generate_id();
        } else if mappings.iter().any(|m| m.id == mapping.id) {
            return Err(StoreError::DuplicateId(mapping.id));
        }

        self.db
            .insert_mapping(&self.bridge(), &mapping.id, &encode(&mapping)?)?;

        tracing::info!(
            bridge = %self.bus,
            mapping_id = %mapping.id,
            topic = %mapping.topic,
            "Mapping created"
        );
        let id = mapping.id.clone();
        mappings.push(mapping);
        self.publish(&mappings);
        Ok(id)
    }

    /// Replace the mapping `id`, keeping its position.
    ///
    /// # Errors
    ///
    /// Returns error if there is no such mapping, or the new definition is
    /// invalid or cannot be written.
    pub fn update(&self, id: &str, mut mapping: Mapping) -> Result<(), StoreError> {
        let mut mappings = self.mappings.lock();
        let index = mappings
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        mapping.id = id.to_string();
        self.check(&mapping)?;

        if !self.db.update_mapping(&self.bridge(), id, &encode(&mapping)?)? {
            return Err(StoreError::NotFound(id.to_string()));
        }

        tracing::info!(
            bridge = %self.bus,
            mapping_id = %id,
            enabled = mapping.enabled,
            "Mapping updated"
        );
        mappings[index] = mapping;
        self.publish(&mappings);
        Ok(())
    }

    /// Delete the mapping `id`.
    ///
    /// # Errors
    ///
    /// Returns error if there is no such mapping or it cannot be deleted.
    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut mappings = self.mappings.lock();
        let index = mappings
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        self.db.delete_mapping(&self.bridge(), id)?;

        tracing::info!(bridge = %self.bus, mapping_id = %id, "Mapping deleted");
        mappings.remove(index);
        self.publish(&mappings);
        Ok(())
    }

    /// All mappings in insertion order.
    #[must_use]
    pub fn list(&self) -> Vec<Mapping> {
        self.mappings.lock().clone()
    }

    /// One mapping.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if there is no such mapping.
    pub fn get(&self, id: &str) -> Result<Mapping, StoreError> {
        self.mappings
            .lock()
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// The current mapping set, shared.
    #[must_use]
    pub fn snapshot(&self) -> MappingSet {
        self.tx.borrow().clone()
    }

    /// Receive the mapping set after every mutation.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<MappingSet> {
        self.tx.subscribe()
    }

    /// Soft warnings for mappings sharing a `(source, topic)` pair.
    #[must_use]
    pub fn duplicate_warnings(&self) -> Vec<String> {
        find_duplicate_routes(&self.snapshot())
            .into_iter()
            .map(|(first, second)| {
                format!(
                    "mappings '{first}' and '{second}' read the same source into the same topic"
                )
            })
            .collect()
    }

    /// Persisted settings of this bridge, defaults if never saved.
    ///
    /// # Errors
    ///
    /// Returns error if the settings cannot be read.
    pub fn settings(&self) -> Result<BridgeSettings, StoreError> {
        Ok(self.db.load_settings(&self.bridge())?.unwrap_or_default())
    }

    /// Persist the settings of this bridge.
    ///
    /// # Errors
    ///
    /// Returns error if the settings cannot be written.
    pub fn save_settings(&self, settings: &BridgeSettings) -> Result<(), StoreError> {
        self.db.save_settings(&self.bridge(), settings)?;
        Ok(())
    }

    fn check(&self, mapping: &Mapping) -> Result<(), ValidationError> {
        if mapping.bus() != self.bus {
            return Err(ValidationError::WrongBus {
                expected: self.bus,
                found: mapping.bus(),
            });
        }
        mapping.validate()
    }

    fn bridge(&self) -> String {
        self.bus.to_string()
    }

    fn publish(&self, mappings: &[Mapping]) {
        self.tx.send_replace(Arc::new(mappings.to_vec()));
    }
}

fn encode(mapping: &Mapping) -> Result<String, StoreError> {
    serde_json::to_string(mapping).map_err(|e| StoreError::Database(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use busbridge_core::Scaling;

    fn store(bus: BusKind) -> MappingStore {
        MappingStore::open(bus, Arc::new(SqliteStore::in_memory().unwrap())).unwrap()
    }

    #[test]
    fn create_assigns_ids_in_order() {
        let store = store(BusKind::Modbus);
        let first = store
            .create(Mapping::modbus("dev1", 10, 3, "plant/a"))
            .unwrap();
        let second = store
            .create(Mapping::modbus("dev1", 11, 4, "plant/b"))
            .unwrap();

        assert!(first.starts_with("map_"));
        assert_ne!(first, second);
        let ids: Vec<_> = store.list().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![first.clone(), second]);
        assert_eq!(store.get(&first).unwrap().topic, "plant/a");
    }

    #[test]
    fn validation_rejects_before_storing() {
        let store = store(BusKind::Modbus);
        let err = store
            .create(Mapping::modbus("dev1", 70_000, 3, "plant/a"))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Validation(ValidationError::RegisterOutOfRange(70_000))
        ));

        let err = store
            .create(Mapping::modbus("dev1", 1, 3, "plant/#"))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Validation(ValidationError::WildcardInTopic { .. })
        ));

        let err = store.create(Mapping::can(0x10, false, "car/x")).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Validation(ValidationError::WrongBus { .. })
        ));
        assert!(store.list().is_empty());
    }

    #[test]
    fn explicit_ids_must_be_unique() {
        let store = store(BusKind::Can);
        let mut mapping = Mapping::can(0x0F6, false, "car/engine");
        mapping.id = "engine".into();
        store.create(mapping.clone()).unwrap();
        assert!(matches!(
            store.create(mapping),
            Err(StoreError::DuplicateId(id)) if id == "engine"
        ));
    }

    #[test]
    fn update_and_delete() {
        let store = store(BusKind::Modbus);
        let id = store
            .create(Mapping::modbus("dev1", 10, 3, "plant/a"))
            .unwrap();

        let mut edited = Mapping::modbus("dev1", 10, 3, "plant/a2");
        edited.scaling = Some(Scaling::new(0.1, 0.0, 1));
        store.update(&id, edited).unwrap();
        let stored = store.get(&id).unwrap();
        assert_eq!(stored.id, id);
        assert_eq!(stored.topic, "plant/a2");

        assert!(matches!(
            store.update("nope", Mapping::modbus("dev1", 1, 3, "t")),
            Err(StoreError::NotFound(_))
        ));

        store.delete(&id).unwrap();
        assert!(matches!(store.delete(&id), Err(StoreError::NotFound(_))));
        assert!(matches!(store.get(&id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn mutations_reach_subscribers() {
        let store = store(BusKind::Can);
        let mut rx = store.subscribe();
        assert!(rx.borrow_and_update().is_empty());

        store.create(Mapping::can(0x0F6, false, "car/engine")).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().len(), 1);
    }

    #[test]
    fn duplicates_are_warnings_only() {
        let store = store(BusKind::Can);
        store.create(Mapping::can(0x0F6, false, "car/engine")).unwrap();
        store.create(Mapping::can(0x0F6, false, "car/engine")).unwrap();

        assert_eq!(store.list().len(), 2);
        assert_eq!(store.duplicate_warnings().len(), 1);
    }

    #[test]
    fn survives_reopen() {
        let db = Arc::new(SqliteStore::in_memory().unwrap());
        let store = MappingStore::open(BusKind::Can, Arc::clone(&db)).unwrap();
        let mut mapping = Mapping::can(0x123, true, "car/x");
        mapping.unit = Some("rpm".into());
        let id = store.create(mapping).unwrap();

        let reopened = MappingStore::open(BusKind::Can, db).unwrap();
        let loaded = reopened.get(&id).unwrap();
        assert_eq!(loaded.unit.as_deref(), Some("rpm"));
        assert!(reopened.settings().unwrap() == BridgeSettings::default());
    }
}
