use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::{trace, warn};

use crate::databin::{append_and_notify, Databin, DatabinClass, DatabinId};
use crate::error::JpipError;
use crate::protocol::message::MessageHeader;

/// Owns every databin of one codestream context and routes incoming
/// protocol payloads to the right one by `(class, in-class id, offset)`.
///
/// Databins are created on first reference and live until the saver (the
/// session's codestream context) is discarded. Each gets a unique serial
/// so pooled per-databin objects can detect identity collisions.
pub struct DatabinsSaver {
    next_serial: u64,
    main_header: Rc<RefCell<Databin>>,
    tile_headers: HashMap<u64, Rc<RefCell<Databin>>>,
    tiles: HashMap<u64, Rc<RefCell<Databin>>>,
    precincts: HashMap<u64, Rc<RefCell<Databin>>>,
    metadata: HashMap<u64, Rc<RefCell<Databin>>>,
}

impl DatabinsSaver {
    pub fn new() -> Self {
        let main_header = Rc::new(RefCell::new(Databin::new(
            DatabinId {
                class: DatabinClass::MainHeader,
                in_class_id: 0,
            },
            0,
        )));
        Self {
            next_serial: 1,
            main_header,
            tile_headers: HashMap::new(),
            tiles: HashMap::new(),
            precincts: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn main_header(&self) -> Rc<RefCell<Databin>> {
        Rc::clone(&self.main_header)
    }

    pub fn tile_header(&mut self, in_class_id: u64) -> Rc<RefCell<Databin>> {
        Self::get_or_create(
            &mut self.tile_headers,
            &mut self.next_serial,
            DatabinClass::TileHeader,
            in_class_id,
        )
    }

    pub fn tile(&mut self, in_class_id: u64) -> Rc<RefCell<Databin>> {
        Self::get_or_create(
            &mut self.tiles,
            &mut self.next_serial,
            DatabinClass::Tile,
            in_class_id,
        )
    }

    pub fn precinct(&mut self, in_class_id: u64) -> Rc<RefCell<Databin>> {
        Self::get_or_create(
            &mut self.precincts,
            &mut self.next_serial,
            DatabinClass::Precinct,
            in_class_id,
        )
    }

    fn get_or_create(
        map: &mut HashMap<u64, Rc<RefCell<Databin>>>,
        next_serial: &mut u64,
        class: DatabinClass,
        in_class_id: u64,
    ) -> Rc<RefCell<Databin>> {
        Rc::clone(map.entry(in_class_id).or_insert_with(|| {
            let serial = *next_serial;
            *next_serial += 1;
            Rc::new(RefCell::new(Databin::new(
                DatabinId { class, in_class_id },
                serial,
            )))
        }))
    }

    /// The precinct databin, if it has ever been referenced; readers
    /// use this to avoid materializing empty databins.
    pub fn loaded_precinct(&self, in_class_id: u64) -> Option<Rc<RefCell<Databin>>> {
        self.precincts.get(&in_class_id).map(Rc::clone)
    }

    pub fn loaded_tile_header(&self, in_class_id: u64) -> Option<Rc<RefCell<Databin>>> {
        self.tile_headers.get(&in_class_id).map(Rc::clone)
    }

    /// Number of precinct databins that have received any data.
    pub fn loaded_precinct_count(&self) -> usize {
        self.precincts.len()
    }

    /// Resolves the databin a message header addresses, creating it on
    /// first reference. `None` for codestreams this saver does not track
    /// (the saver is a single-codestream context).
    pub fn databin_for(
        &mut self,
        header: &MessageHeader,
    ) -> Result<Option<Rc<RefCell<Databin>>>, JpipError> {
        if header.codestream_index != 0 {
            warn!(
                "ignoring message for codestream {} (single-codestream session)",
                header.codestream_index
            );
            return Ok(None);
        }
        trace!(
            "message class={:?} id={} offset={} len={} last={}",
            header.class,
            header.in_class_id,
            header.body_offset,
            header.body_length,
            header.is_last_in_databin
        );

        let bin = match header.class {
            DatabinClass::MainHeader => {
                if header.in_class_id != 0 {
                    return Err(JpipError::BadMainHeaderId(header.in_class_id));
                }
                self.main_header()
            }
            DatabinClass::TileHeader => self.tile_header(header.in_class_id),
            DatabinClass::Tile | DatabinClass::ExtendedTile => self.tile(header.in_class_id),
            DatabinClass::Precinct | DatabinClass::ExtendedPrecinct => {
                self.precinct(header.in_class_id)
            }
            DatabinClass::Metadata => Self::get_or_create(
                &mut self.metadata,
                &mut self.next_serial,
                DatabinClass::Metadata,
                header.in_class_id,
            ),
        };
        Ok(Some(bin))
    }

    /// Routes one parsed message body into its databin and fires the
    /// databin's listeners when the append committed new information.
    pub fn save_message(&mut self, header: &MessageHeader, body: &[u8]) -> Result<(), JpipError> {
        if body.len() < header.body_length {
            return Err(JpipError::TruncatedMessageBody);
        }
        let Some(bin) = self.databin_for(header)? else {
            return Ok(());
        };
        append_and_notify(
            &bin,
            header.body_offset,
            &body[..header.body_length],
            header.is_last_in_databin,
        )?;
        Ok(())
    }
}

impl Default for DatabinsSaver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(class: DatabinClass, id: u64, offset: usize, len: usize) -> MessageHeader {
        MessageHeader {
            class,
            codestream_index: 0,
            in_class_id: id,
            body_offset: offset,
            body_length: len,
            is_last_in_databin: false,
            aux: None,
        }
    }

    #[test]
    fn routes_by_class_and_id() {
        let mut saver = DatabinsSaver::new();
        saver
            .save_message(&header(DatabinClass::MainHeader, 0, 0, 3), &[1, 2, 3])
            .unwrap();
        saver
            .save_message(&header(DatabinClass::Precinct, 5, 0, 2), &[9, 9])
            .unwrap();

        assert_eq!(saver.main_header().borrow().loaded_prefix_len(), 3);
        assert_eq!(saver.precinct(5).borrow().loaded_prefix_len(), 2);
        assert_eq!(saver.loaded_precinct_count(), 1);
    }

    #[test]
    fn same_id_different_class_are_distinct_bins() {
        let mut saver = DatabinsSaver::new();
        saver
            .save_message(&header(DatabinClass::Precinct, 2, 0, 1), &[1])
            .unwrap();
        saver
            .save_message(&header(DatabinClass::TileHeader, 2, 0, 4), &[0; 4])
            .unwrap();
        assert_eq!(saver.precinct(2).borrow().loaded_prefix_len(), 1);
        assert_eq!(saver.tile_header(2).borrow().loaded_prefix_len(), 4);
    }

    #[test]
    fn nonzero_main_header_id_is_rejected() {
        let mut saver = DatabinsSaver::new();
        let err = saver
            .save_message(&header(DatabinClass::MainHeader, 1, 0, 1), &[0])
            .unwrap_err();
        assert_eq!(err, JpipError::BadMainHeaderId(1));
    }

    #[test]
    fn truncated_body_is_rejected() {
        let mut saver = DatabinsSaver::new();
        let err = saver
            .save_message(&header(DatabinClass::Precinct, 0, 0, 4), &[0; 2])
            .unwrap_err();
        assert_eq!(err, JpipError::TruncatedMessageBody);
    }
}
