use crate::image_set::ImageName;
use crate::process::Pid;
use bitflags::bitflags;
use std::collections::VecDeque;
use std::sync::mpsc;

bitflags! {
    /// Reason bits attached to start-splitting/stop-splitting events.
    /// Values are fixed so they remain stable across wire versions.
    pub struct SplittingReason: u32 {
        const BY_INHERITANCE    = 0b0001;
        const BY_CONFIG         = 0b0010;
        const PROCESS_ARRIVING  = 0b0100;
        const PROCESS_DEPARTING = 0b1000;
    }
}

/// One outbound notification, tagged by kind. Self-describing: user-space
/// can consume it without an additional schema lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRecord {
    StartSplitting {
        pid: Pid,
        reason: SplittingReason,
        image: ImageName,
    },
    StopSplitting {
        pid: Pid,
        reason: SplittingReason,
        image: ImageName,
    },
    StartSplittingError {
        pid: Pid,
        image: ImageName,
    },
    StopSplittingError {
        pid: Pid,
        image: ImageName,
    },
    ErrorMessage {
        status: u32,
        message: String,
    },
}

/// A caller's DEQUEUE-EVENT request, captured because no event was queued
/// when it arrived. `capacity` is the caller's output buffer size; a record
/// too large to fit the buffer is left queued rather than delivered
/// truncated. `completion` is sent the event that later resolves this
/// request, mirroring the original's practice of completing the pended
/// request in place once a matching event shows up.
pub struct PendedRequest {
    pub capacity: usize,
    completion: mpsc::Sender<EventRecord>,
}

pub enum EventDeliveryResult {
    /// Delivered immediately; caller should write `record` into its buffer.
    Delivered(EventRecord),
    /// No event was ready; the request has been queued. `completion` yields
    /// the record once a matching event arrives.
    Pended(mpsc::Receiver<EventRecord>),
}

/// Outbound event queue paired with a pended-request queue, implementing
/// the "inverted" delivery scheme: whichever arrives second (an event or a
/// dequeue request) resolves the one already waiting.
#[derive(Default)]
pub struct Eventing {
    events: VecDeque<EventRecord>,
    pended: VecDeque<PendedRequest>,
}

impl Eventing {
    pub fn new() -> Self {
        Eventing {
            events: VecDeque::new(),
            pended: VecDeque::new(),
        }
    }

    /// Emits `record`. If a pended request exists with room for it, it is
    /// completed directly with `record` (matched in FIFO order so the oldest
    /// UI/CLI request wins); otherwise the record joins the event queue.
    pub fn emit(&mut self, record: EventRecord, encoded_size: impl Fn(&EventRecord) -> usize) {
        if let Some(index) = self.pended.iter().position(|req| req.capacity >= encoded_size(&record)) {
            let pended = self.pended.remove(index).unwrap();
            // The receiving end may already be gone (caller stopped waiting);
            // that is not this module's problem to report.
            let _ = pended.completion.send(record);
            return;
        }
        self.events.push_back(record);
    }

    /// Handles a DEQUEUE-EVENT request with the given output capacity. If
    /// an event is already queued and fits, it is delivered; otherwise the
    /// request itself is pended and a receiver is returned that resolves
    /// once a matching event arrives.
    pub fn collect(&mut self, capacity: usize, encoded_size: impl Fn(&EventRecord) -> usize) -> EventDeliveryResult {
        if let Some(front) = self.events.front() {
            if encoded_size(front) <= capacity {
                return EventDeliveryResult::Delivered(self.events.pop_front().unwrap());
            }
        }
        let (completion, receiver) = mpsc::channel();
        self.pended.push_back(PendedRequest { capacity, completion });
        EventDeliveryResult::Pended(receiver)
    }

    pub fn queued_event_count(&self) -> usize {
        self.events.len()
    }

    pub fn pended_request_count(&self) -> usize {
        self.pended.len()
    }

    /// Releases all queued events and cancels all pended requests. Called
    /// on driver teardown/reset.
    pub fn teardown(&mut self) {
        self.events.clear();
        self.pended.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn size(_record: &EventRecord) -> usize {
        64
    }

    #[test]
    fn emit_then_collect_round_trips() {
        let mut eventing = Eventing::new();
        let record = EventRecord::StartSplitting {
            pid: 1,
            reason: SplittingReason::BY_CONFIG | SplittingReason::PROCESS_ARRIVING,
            image: ImageName::new("\\device\\app.exe"),
        };
        eventing.emit(record.clone(), size);
        match eventing.collect(128, size) {
            EventDeliveryResult::Delivered(delivered) => assert_eq!(delivered, record),
            EventDeliveryResult::Pended(_) => panic!("expected immediate delivery"),
        }
    }

    #[test]
    fn collect_before_emit_pends_request_and_completes_it() {
        let mut eventing = Eventing::new();
        let receiver = match eventing.collect(128, size) {
            EventDeliveryResult::Pended(receiver) => receiver,
            EventDeliveryResult::Delivered(_) => panic!("expected pend"),
        };
        assert_eq!(eventing.pended_request_count(), 1);

        let record = EventRecord::StopSplitting {
            pid: 2,
            reason: SplittingReason::PROCESS_DEPARTING,
            image: ImageName::new("\\device\\app.exe"),
        };
        eventing.emit(record.clone(), size);
        assert_eq!(eventing.pended_request_count(), 0);
        assert_eq!(eventing.queued_event_count(), 0);

        assert_eq!(receiver.try_recv().unwrap(), record);
    }

    #[test]
    fn teardown_clears_both_queues() {
        let mut eventing = Eventing::new();
        eventing.emit(
            EventRecord::ErrorMessage {
                status: 1,
                message: "x".into(),
            },
            size,
        );
        eventing.teardown();
        assert_eq!(eventing.queued_event_count(), 0);
    }
}
