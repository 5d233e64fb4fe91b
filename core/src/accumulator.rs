use crate::message::RawMessage;

/// Why a flush was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    BatchFull,
    Timer,
}

/// Buffers deliveries and hands them off at flush boundaries.
///
/// Two states: idle and flushing. Entering a flush swaps the buffer for an
/// empty one, so the batch being processed is never the buffer still taking
/// arrivals. While flushing, further flush requests are dropped and new
/// arrivals keep accumulating for the next flush.
#[derive(Debug)]
pub struct Accumulator {
    buffer: Vec<RawMessage>,
    batch_size: usize,
    flushing: bool,
}

impl Accumulator {
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            buffer: Vec::with_capacity(batch_size),
            batch_size,
            flushing: false,
        }
    }

    /// Appends a delivery. Returns `true` once the buffer holds a full batch.
    pub fn push(&mut self, message: RawMessage) -> bool {
        self.buffer.push(message);
        self.buffer.len() >= self.batch_size
    }

    /// Enters the flushing state and takes ownership of the buffered batch,
    /// which may be empty. Returns `None` if a flush is already running.
    pub fn begin_flush(&mut self) -> Option<Vec<RawMessage>> {
        if self.flushing {
            return None;
        }
        self.flushing = true;
        Some(std::mem::replace(
            &mut self.buffer,
            Vec::with_capacity(self.batch_size),
        ))
    }

    pub fn finish_flush(&mut self) {
        self.flushing = false;
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drops everything buffered without processing it. Returns how many
    /// deliveries were dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DeliveryHandle;

    fn message(tag: u64) -> RawMessage {
        RawMessage::new(tag.to_string(), DeliveryHandle { generation: 1, tag })
    }

    #[test]
    fn test_push_signals_full_batch() {
        let mut accumulator = Accumulator::new(3);
        assert!(!accumulator.push(message(1)));
        assert!(!accumulator.push(message(2)));
        assert!(accumulator.push(message(3)));
        assert!(accumulator.push(message(4)));
    }

    #[test]
    fn test_begin_flush_swaps_buffer() {
        let mut accumulator = Accumulator::new(2);
        accumulator.push(message(1));
        accumulator.push(message(2));

        let batch = accumulator.begin_flush().unwrap();
        let tags: Vec<u64> = batch.iter().map(|m| m.handle.tag).collect();
        assert_eq!(tags, vec![1, 2]);
        assert!(accumulator.is_empty());
        assert!(accumulator.is_flushing());
    }

    #[test]
    fn test_flush_requests_dropped_while_flushing() {
        let mut accumulator = Accumulator::new(1);
        accumulator.push(message(1));
        let _batch = accumulator.begin_flush().unwrap();

        assert!(accumulator.push(message(2)));
        assert!(accumulator.begin_flush().is_none());
        assert_eq!(accumulator.len(), 1);

        accumulator.finish_flush();
        let next = accumulator.begin_flush().unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].handle.tag, 2);
    }

    #[test]
    fn test_empty_flush_is_allowed() {
        let mut accumulator = Accumulator::new(5);
        let batch = accumulator.begin_flush().unwrap();
        assert!(batch.is_empty());
        accumulator.finish_flush();
        assert!(!accumulator.is_flushing());
    }

    #[test]
    fn test_zero_batch_size_behaves_as_one() {
        let mut accumulator = Accumulator::new(0);
        assert!(accumulator.push(message(1)));
    }

    #[test]
    fn test_discard() {
        let mut accumulator = Accumulator::new(10);
        accumulator.push(message(1));
        accumulator.push(message(2));
        assert_eq!(accumulator.discard(), 2);
        assert!(accumulator.is_empty());
    }
}
