use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::databin::{Databin, DatabinId};
use crate::error::JpipError;

/// Maps a databin identity to exactly one cached object for the
/// databin's lifetime (e.g. a precinct's quality-layer parse state).
///
/// The databin serial number guards the invariant that two different
/// databin instances never share a `(class, in-class id)` key; a
/// collision is an internal consistency failure, not a recoverable
/// condition.
pub struct ObjectPoolByDatabin<T> {
    entries: HashMap<DatabinId, PoolEntry<T>>,
}

struct PoolEntry<T> {
    serial: u64,
    object: Rc<RefCell<T>>,
}

impl<T> ObjectPoolByDatabin<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Returns the object cached for `databin`, creating it with
    /// `create` on first reference.
    pub fn object_for(
        &mut self,
        databin: &Databin,
        create: impl FnOnce() -> Result<T, JpipError>,
    ) -> Result<Rc<RefCell<T>>, JpipError> {
        match self.entries.get(&databin.id()) {
            Some(entry) => {
                if entry.serial != databin.serial() {
                    return Err(JpipError::DuplicateDatabinInPool);
                }
                Ok(Rc::clone(&entry.object))
            }
            None => {
                let object = Rc::new(RefCell::new(create()?));
                self.entries.insert(
                    databin.id(),
                    PoolEntry {
                        serial: databin.serial(),
                        object: Rc::clone(&object),
                    },
                );
                Ok(object)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for ObjectPoolByDatabin<T> {
    fn default() -> Self {
        Self::new()
    }
}
