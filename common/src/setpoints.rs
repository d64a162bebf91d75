use std::{cell::RefCell, rc::Rc};

use log::{info, warn};

use crate::{config::Setpoints, error::StoreError};

/// Durable key-value collaborator holding the setpoint record.
pub trait SetpointPersistence {
    /// `Ok(None)` means no record has been written yet.
    fn load(&self) -> Result<Option<Setpoints>, StoreError>;
    fn save(&mut self, setpoints: &Setpoints) -> Result<(), StoreError>;
}

#[derive(Debug)]
pub struct SetpointStore<P> {
    persistence: P,
    current: Setpoints,
}

impl<P: SetpointPersistence> SetpointStore<P> {
    /// Builds the store and restores the persisted record, falling back to
    /// firmware defaults.
    pub fn new(persistence: P) -> Self {
        let mut store = Self {
            persistence,
            current: Setpoints::default(),
        };
        store.current = store.load();
        store
    }

    /// Never fails: a missing record or unavailable storage yields defaults.
    pub fn load(&self) -> Setpoints {
        match self.persistence.load() {
            Ok(Some(setpoints)) => {
                info!("setpoints restored from storage: {setpoints:?}");
                setpoints
            }
            Ok(None) => {
                info!("no persisted setpoints, using factory defaults");
                Setpoints::default()
            }
            Err(err) => {
                warn!("setpoint storage unavailable ({err}); using factory defaults");
                Setpoints::default()
            }
        }
    }

    /// Overwrites the in-memory record and persists it synchronously.
    ///
    /// A persistence failure is logged and swallowed; the in-memory record
    /// stays applied until the next reboot.
    pub fn apply(&mut self, setpoints: Setpoints) {
        if !setpoints.bands_ordered() {
            warn!("applying setpoints with an inverted band: {setpoints:?}");
        }
        self.current = setpoints;
        info!(
            "setpoints applied: lux={} temp=[{:.1}-{:.1}] humidity=[{:.1}-{:.1}] co={} co2={} tvocs={}",
            setpoints.lux,
            setpoints.temp_min_c,
            setpoints.temp_max_c,
            setpoints.humidity_min_pct,
            setpoints.humidity_max_pct,
            setpoints.co,
            setpoints.co2_ppm,
            setpoints.tvocs_ppb
        );

        if let Err(err) = self.persistence.save(&setpoints) {
            warn!("failed to persist setpoints, they will revert on reboot: {err}");
        }
    }

    pub fn current(&self) -> &Setpoints {
        &self.current
    }

    pub fn persistence(&self) -> &P {
        &self.persistence
    }
}

#[derive(Debug, Default)]
struct MemoryCell {
    record: Option<Setpoints>,
    available: bool,
    saves: usize,
}

/// Volatile persistence used by tests and the host simulation.
///
/// Clones share the same backing cell, which lets a test keep a handle after
/// moving the persistence into a [`SetpointStore`].
#[derive(Debug, Clone)]
pub struct MemorySetpointPersistence {
    cell: Rc<RefCell<MemoryCell>>,
}

impl Default for MemorySetpointPersistence {
    fn default() -> Self {
        Self {
            cell: Rc::new(RefCell::new(MemoryCell {
                record: None,
                available: true,
                saves: 0,
            })),
        }
    }
}

impl MemorySetpointPersistence {
    pub fn with_record(setpoints: Setpoints) -> Self {
        let persistence = Self::default();
        persistence.cell.borrow_mut().record = Some(setpoints);
        persistence
    }

    pub fn set_available(&self, available: bool) {
        self.cell.borrow_mut().available = available;
    }

    pub fn record(&self) -> Option<Setpoints> {
        self.cell.borrow().record
    }

    pub fn save_count(&self) -> usize {
        self.cell.borrow().saves
    }
}

impl SetpointPersistence for MemorySetpointPersistence {
    fn load(&self) -> Result<Option<Setpoints>, StoreError> {
        let cell = self.cell.borrow();
        if !cell.available {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(cell.record)
    }

    fn save(&mut self, setpoints: &Setpoints) -> Result<(), StoreError> {
        let mut cell = self.cell.borrow_mut();
        if !cell.available {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        cell.record = Some(*setpoints);
        cell.saves += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Setpoints {
        Setpoints {
            lux: 800,
            temp_min_c: 22.0,
            temp_max_c: 26.0,
            humidity_min_pct: 70.0,
            humidity_max_pct: 90.0,
            co: 250,
            co2_ppm: 1_000,
            tvocs_ppb: 80,
        }
    }

    #[test]
    fn empty_storage_loads_defaults() {
        let store = SetpointStore::new(MemorySetpointPersistence::default());
        assert_eq!(*store.current(), Setpoints::default());
    }

    #[test]
    fn unavailable_storage_loads_defaults() {
        let persistence = MemorySetpointPersistence::with_record(sample());
        persistence.set_available(false);

        let store = SetpointStore::new(persistence);
        assert_eq!(*store.current(), Setpoints::default());
    }

    #[test]
    fn persisted_record_is_restored_at_boot() {
        let store = SetpointStore::new(MemorySetpointPersistence::with_record(sample()));
        assert_eq!(*store.current(), sample());
    }

    #[test]
    fn apply_then_load_round_trips() {
        let mut store = SetpointStore::new(MemorySetpointPersistence::default());
        store.apply(sample());

        assert_eq!(store.load(), sample());
        assert_eq!(*store.current(), sample());
        assert_eq!(store.persistence().save_count(), 1);
    }

    #[test]
    fn failed_save_keeps_in_memory_record() {
        let persistence = MemorySetpointPersistence::default();
        let handle = persistence.clone();
        let mut store = SetpointStore::new(persistence);
        handle.set_available(false);

        store.apply(sample());

        assert_eq!(*store.current(), sample());
        assert_eq!(handle.record(), None);
    }
}
