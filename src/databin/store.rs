use std::cell::RefCell;
use std::convert::TryFrom;
use std::rc::Rc;

use num_enum::TryFromPrimitive;

use crate::error::JpipError;

/// Databin class ids as they appear on the wire (ISO/IEC 15444-9 A.2.2).
///
/// Odd classes are the "extended" forms of the class below them and carry
/// one auxiliary VBAS field in their message headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum DatabinClass {
    Precinct = 0,
    ExtendedPrecinct = 1,
    TileHeader = 2,
    Tile = 4,
    ExtendedTile = 5,
    MainHeader = 6,
    Metadata = 8,
}

impl DatabinClass {
    /// Extended classes carry an auxiliary VBAS field in message headers.
    pub fn has_aux_field(self) -> bool {
        (self as u8) & 1 == 1
    }

    pub fn from_class_id(class_id: u64) -> Result<Self, JpipError> {
        let byte = u8::try_from(class_id).map_err(|_| JpipError::UnknownDatabinClass(class_id))?;
        Self::try_from(byte).map_err(|_| JpipError::UnknownDatabinClass(class_id))
    }
}

/// Identity of a databin within one codestream context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DatabinId {
    pub class: DatabinClass,
    pub in_class_id: u64,
}

/// A contiguous run of loaded bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: usize,
    pub length: usize,
}

impl ByteRange {
    pub fn end(&self) -> usize {
        self.start + self.length
    }
}

/// Listener invoked after a distinct append committed new information.
pub type Listener = Rc<dyn Fn()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle(u32);

/// Incrementally-delivered byte stream unit.
///
/// Holds an ordered, non-overlapping set of loaded byte ranges over a
/// dense backing buffer. Reads outside a loaded range return `None`
/// ("not yet available"), never an error.
pub struct Databin {
    id: DatabinId,
    serial: u64,
    data: Vec<u8>,
    ranges: Vec<ByteRange>,
    total_length: Option<usize>,
    listeners: Vec<(ListenerHandle, Listener)>,
    next_listener: u32,
}

impl Databin {
    /// `serial` must be unique per databin instance; the object pool uses
    /// it to detect identity collisions.
    pub fn new(id: DatabinId, serial: u64) -> Self {
        Self {
            id,
            serial,
            data: Vec::new(),
            ranges: Vec::new(),
            total_length: None,
            listeners: Vec::new(),
            next_listener: 0,
        }
    }

    pub fn id(&self) -> DatabinId {
        self.id
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Merges `bytes` at `start` into the loaded set. Idempotent when the
    /// range is already loaded. `is_last` marks `start + bytes.len()` as
    /// the databin's total length.
    ///
    /// Returns `true` when the append committed new information (new
    /// bytes or a newly learned total length). Listeners are *not* fired
    /// here; use [`append_and_notify`] so they run outside the mutable
    /// borrow.
    pub fn append(&mut self, start: usize, bytes: &[u8], is_last: bool) -> Result<bool, JpipError> {
        let end = start + bytes.len();
        if let Some(known) = self.total_length {
            if end > known {
                return Err(JpipError::DatabinLengthConflict { known, end });
            }
            if is_last && end != known {
                return Err(JpipError::DatabinLengthChanged {
                    known,
                    claimed: end,
                });
            }
        }

        let mut changed = false;
        if is_last && self.total_length.is_none() {
            self.total_length = Some(end);
            changed = true;
        }

        if !bytes.is_empty() {
            if self.data.len() < end {
                self.data.resize(end, 0);
            }
            self.data[start..end].copy_from_slice(bytes);
            if self.merge_range(ByteRange {
                start,
                length: bytes.len(),
            }) {
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Inserts a range, coalescing with overlapping or adjacent ranges.
    /// Returns `true` if any previously unloaded byte became loaded.
    fn merge_range(&mut self, range: ByteRange) -> bool {
        let mut merged = range;
        let mut covered = 0usize;
        let mut insert_at = self.ranges.len();
        let mut remove = Vec::new();

        for (i, existing) in self.ranges.iter().enumerate() {
            if existing.end() < merged.start {
                continue;
            }
            if existing.start > merged.end() {
                insert_at = insert_at.min(i);
                break;
            }
            // Overlapping or adjacent: coalesce.
            let overlap_start = existing.start.max(range.start);
            let overlap_end = existing.end().min(range.end());
            if overlap_end > overlap_start {
                covered += overlap_end - overlap_start;
            }
            let new_start = merged.start.min(existing.start);
            let new_end = merged.end().max(existing.end());
            merged = ByteRange {
                start: new_start,
                length: new_end - new_start,
            };
            remove.push(i);
            insert_at = insert_at.min(i);
        }

        for &i in remove.iter().rev() {
            self.ranges.remove(i);
        }
        self.ranges.insert(insert_at.min(self.ranges.len()), merged);
        covered < range.length
    }

    /// Sorted, non-overlapping loaded ranges.
    pub fn existing_ranges(&self) -> &[ByteRange] {
        &self.ranges
    }

    /// Total length, if the "last byte" flag has been observed.
    pub fn known_length(&self) -> Option<usize> {
        self.total_length
    }

    pub fn is_fully_loaded(&self) -> bool {
        match self.total_length {
            Some(0) => true,
            Some(len) => self
                .ranges
                .first()
                .is_some_and(|r| r.start == 0 && r.length >= len),
            None => false,
        }
    }

    /// Number of bytes loaded contiguously from offset 0.
    pub fn loaded_prefix_len(&self) -> usize {
        match self.ranges.first() {
            Some(r) if r.start == 0 => r.length,
            _ => 0,
        }
    }

    /// `None` when the offset is outside every loaded range.
    pub fn read_byte(&self, offset: usize) -> Option<u8> {
        if self.is_loaded(offset, 1) {
            Some(self.data[offset])
        } else {
            None
        }
    }

    /// Contiguous read; `None` unless the whole span is loaded.
    pub fn read_bytes(&self, offset: usize, length: usize) -> Option<&[u8]> {
        if length == 0 {
            return Some(&[]);
        }
        if self.is_loaded(offset, length) {
            Some(&self.data[offset..offset + length])
        } else {
            None
        }
    }

    fn is_loaded(&self, offset: usize, length: usize) -> bool {
        self.ranges
            .iter()
            .any(|r| r.start <= offset && offset + length <= r.end())
    }

    pub fn on_data_arrived(&mut self, listener: Listener) -> ListenerHandle {
        let handle = ListenerHandle(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((handle, listener));
        handle
    }

    pub fn remove_listener(&mut self, handle: ListenerHandle) {
        self.listeners.retain(|(h, _)| *h != handle);
    }

    fn cloned_listeners(&self) -> Vec<Listener> {
        self.listeners.iter().map(|(_, l)| Rc::clone(l)).collect()
    }
}

/// Appends through the shared cell and fires listeners in registration
/// order after the mutable borrow is released, so listeners may read the
/// databin freely.
pub fn append_and_notify(
    bin: &RefCell<Databin>,
    start: usize,
    bytes: &[u8],
    is_last: bool,
) -> Result<bool, JpipError> {
    let (changed, listeners) = {
        let mut b = bin.borrow_mut();
        let changed = b.append(start, bytes, is_last)?;
        let listeners = if changed {
            b.cloned_listeners()
        } else {
            Vec::new()
        };
        (changed, listeners)
    };
    for listener in &listeners {
        listener();
    }
    Ok(changed)
}
