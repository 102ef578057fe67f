// SPDX-License-Identifier: GPL-3.0-only

//! At-most-once tracking for early deliveries
//!
//! Partial results and shutter notifications bypass the aggregation map. A
//! fixed ring indexed by `frame_number % capacity` remembers what was already
//! forwarded for each recent frame.

use crate::multicam::types::{FrameNumber, PartialResultKind};

/// Early delivery kinds tracked per frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EarlyDelivery {
    Partial(PartialResultKind),
    Shutter,
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    frame_number: FrameNumber,
    driver_sent: bool,
    chi_sent: bool,
    shutter_sent: bool,
}

impl Slot {
    fn flag(&mut self, delivery: EarlyDelivery) -> &mut bool {
        match delivery {
            EarlyDelivery::Partial(PartialResultKind::Driver) => &mut self.driver_sent,
            EarlyDelivery::Partial(PartialResultKind::Chi) => &mut self.chi_sent,
            EarlyDelivery::Shutter => &mut self.shutter_sent,
        }
    }
}

#[derive(Debug)]
pub struct PartialRing {
    slots: Vec<Option<Slot>>,
}

impl PartialRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim the right to forward `delivery` for `frame_number`.
    ///
    /// Returns false when it was already forwarded, or when the frame is so
    /// old that a newer frame has taken over its slot.
    pub fn claim(&mut self, frame_number: FrameNumber, delivery: EarlyDelivery) -> bool {
        let index = (frame_number % self.slots.len() as u64) as usize;
        let slot = &mut self.slots[index];

        if let Some(existing) = slot.as_mut() {
            if existing.frame_number > frame_number {
                return false;
            }
            if existing.frame_number == frame_number {
                return !std::mem::replace(existing.flag(delivery), true);
            }
        }

        let mut fresh = Slot {
            frame_number,
            ..Slot::default()
        };
        *fresh.flag(delivery) = true;
        *slot = Some(fresh);
        true
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }
}
