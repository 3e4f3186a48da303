//! Trace writers: buffering and delivery of completed chunks.

pub(crate) mod agent;
pub(crate) mod log;

use crate::trace::Chunk;

/// Sink for completed trace chunks. `add` buffers, `flush` hands the
/// current buffer to delivery, `stop` flushes and waits for in-flight
/// deliveries to settle.
pub(crate) trait TraceWriter: Send {
    fn add(&mut self, chunk: &Chunk);

    fn flush(&mut self);

    fn stop(&mut self);
}

/// Fans every call out to an ordered list of writers.
pub(crate) struct MultiTraceWriter {
    writers: Vec<Box<dyn TraceWriter>>,
}

impl MultiTraceWriter {
    pub(crate) fn new(writers: Vec<Box<dyn TraceWriter>>) -> Self {
        MultiTraceWriter { writers }
    }
}

impl TraceWriter for MultiTraceWriter {
    fn add(&mut self, chunk: &Chunk) {
        for writer in &mut self.writers {
            writer.add(chunk);
        }
    }

    fn flush(&mut self) {
        for writer in &mut self.writers {
            writer.flush();
        }
    }

    fn stop(&mut self) {
        for writer in &mut self.writers {
            writer.stop();
        }
    }
}
