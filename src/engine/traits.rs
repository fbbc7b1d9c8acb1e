use crate::{
    codec::FrameError,
    error::{Error, Result},
    event::Event,
    log::LogReader,
    types::Sequence,
};

/// Random access to committed events.
///
/// The projector reads payloads through this seam. The store backs it with
/// the log file and the offsets it planned from the index; tests can back it
/// with a plain vector, which ignores the offset.
pub trait EventSource {
    /// Returns the event with this sequence, stored at byte `offset` of the log.
    fn event_at(&self, sequence: Sequence, offset: u64) -> Result<Event>;
}

impl EventSource for LogReader {
    fn event_at(&self, sequence: Sequence, offset: u64) -> Result<Event> {
        let event = self.read_at(offset)?.event;
        if event.sequence != sequence {
            return Err(Error::CorruptFrame {
                offset,
                source: FrameError::SequenceGap {
                    expected: sequence,
                    found: event.sequence,
                },
            });
        }
        Ok(event)
    }
}

impl EventSource for [Event] {
    fn event_at(&self, sequence: Sequence, _offset: u64) -> Result<Event> {
        let pos = sequence
            .checked_sub(1)
            .and_then(|p| usize::try_from(p).ok())
            .ok_or(Error::SequenceNotFound(sequence))?;
        self.get(pos).cloned().ok_or(Error::SequenceNotFound(sequence))
    }
}

impl EventSource for Vec<Event> {
    fn event_at(&self, sequence: Sequence, offset: u64) -> Result<Event> {
        self.as_slice().event_at(sequence, offset)
    }
}
