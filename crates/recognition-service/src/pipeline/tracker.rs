//! Collapses per-frame matches into appearance events
//!
//! Each identity is either idle or has one open event. An open event absorbs
//! sightings until the identity has been unseen for longer than the exit
//! delay; the event then closes with `end_time = last_seen_time`.

use crate::error::{RecognitionError, RecognitionResult};
use common::recognition::AppearanceEvent;
use std::collections::BTreeMap;

/// A recognized face fed into the tracker
#[derive(Debug, Clone)]
pub struct Sighting<C> {
    pub identity_id: String,
    pub display_name: String,
    pub group_label: String,
    pub similarity: f32,
    /// Face crop, kept for the best sighting of each event
    pub crop: C,
}

/// A closed event together with the crop of its best sighting
#[derive(Debug, Clone)]
pub struct ClosedAppearance<C> {
    pub event: AppearanceEvent,
    pub crop: C,
}

#[derive(Debug)]
struct OpenEvent<C> {
    event: AppearanceEvent,
    crop: C,
}

impl<C> OpenEvent<C> {
    fn start(timestamp: f64, sighting: Sighting<C>) -> Self {
        Self {
            event: AppearanceEvent {
                identity_id: sighting.identity_id,
                display_name: sighting.display_name,
                group_label: sighting.group_label,
                start_time: timestamp,
                last_seen_time: timestamp,
                end_time: None,
                peak_similarity: sighting.similarity,
                sightings: 1,
                sample_crop_reference: None,
            },
            crop: sighting.crop,
        }
    }

    fn extend(&mut self, timestamp: f64, sighting: Sighting<C>) {
        self.event.last_seen_time = timestamp;
        self.event.sightings += 1;
        if sighting.similarity > self.event.peak_similarity {
            self.event.peak_similarity = sighting.similarity;
            self.crop = sighting.crop;
        }
    }

    fn close(mut self) -> ClosedAppearance<C> {
        self.event.end_time = Some(self.event.last_seen_time);
        ClosedAppearance {
            event: self.event,
            crop: self.crop,
        }
    }
}

pub struct AppearanceTracker<C> {
    exit_delay: f64,
    open: BTreeMap<String, OpenEvent<C>>,
    last_timestamp: Option<f64>,
}

impl<C> AppearanceTracker<C> {
    pub fn new(exit_delay_secs: f64) -> RecognitionResult<Self> {
        if !exit_delay_secs.is_finite() || exit_delay_secs < 0.0 {
            return Err(RecognitionError::invalid_parameter(format!(
                "exit delay must be a finite value of 0 or more, got {}",
                exit_delay_secs
            )));
        }
        Ok(Self {
            exit_delay: exit_delay_secs,
            open: BTreeMap::new(),
            last_timestamp: None,
        })
    }

    pub fn exit_delay(&self) -> f64 {
        self.exit_delay
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// The open event of `identity_id`, if any
    pub fn open_event(&self, identity_id: &str) -> Option<&AppearanceEvent> {
        self.open.get(identity_id).map(|open| &open.event)
    }

    /// Feed the recognized faces of the frame at `timestamp`
    ///
    /// Returns the events closed by this frame, ordered by start time and
    /// identity. Frames must arrive in non-decreasing timestamp order; an
    /// earlier frame is rejected without touching any state.
    pub fn observe(
        &mut self,
        timestamp: f64,
        sightings: Vec<Sighting<C>>,
    ) -> RecognitionResult<Vec<ClosedAppearance<C>>> {
        if !timestamp.is_finite() {
            return Err(RecognitionError::invalid_parameter(format!(
                "frame timestamp must be finite, got {}",
                timestamp
            )));
        }
        if let Some(last) = self.last_timestamp {
            if timestamp < last {
                return Err(RecognitionError::OutOfOrderFrame { timestamp, last });
            }
        }
        self.last_timestamp = Some(timestamp);

        // Several faces of one identity in a frame count as one sighting
        let mut best: BTreeMap<String, Sighting<C>> = BTreeMap::new();
        for sighting in sightings {
            match best.get(&sighting.identity_id) {
                Some(existing) if existing.similarity >= sighting.similarity => {}
                _ => {
                    best.insert(sighting.identity_id.clone(), sighting);
                }
            }
        }

        let mut closed = Vec::new();

        let mut seen = Vec::with_capacity(best.len());
        for (identity_id, sighting) in best {
            match self.open.remove(&identity_id) {
                Some(mut open) => {
                    if timestamp - open.event.last_seen_time > self.exit_delay {
                        closed.push(open.close());
                        self.open
                            .insert(identity_id.clone(), OpenEvent::start(timestamp, sighting));
                    } else {
                        open.extend(timestamp, sighting);
                        self.open.insert(identity_id.clone(), open);
                    }
                }
                None => {
                    self.open
                        .insert(identity_id.clone(), OpenEvent::start(timestamp, sighting));
                }
            }
            seen.push(identity_id);
        }

        let expired: Vec<String> = self
            .open
            .iter()
            .filter(|(id, open)| {
                !seen.contains(*id) && timestamp - open.event.last_seen_time > self.exit_delay
            })
            .map(|(id, _)| id.clone())
            .collect();
        for identity_id in expired {
            if let Some(open) = self.open.remove(&identity_id) {
                closed.push(open.close());
            }
        }

        sort_closed(&mut closed);
        Ok(closed)
    }

    /// Close every open event at end of video
    pub fn finish(&mut self) -> Vec<ClosedAppearance<C>> {
        let mut closed: Vec<ClosedAppearance<C>> = std::mem::take(&mut self.open)
            .into_values()
            .map(OpenEvent::close)
            .collect();
        sort_closed(&mut closed);
        closed
    }
}

fn sort_closed<C>(closed: &mut [ClosedAppearance<C>]) {
    closed.sort_by(|a, b| {
        a.event
            .start_time
            .total_cmp(&b.event.start_time)
            .then_with(|| a.event.identity_id.cmp(&b.event.identity_id))
    });
}
