use crate::pipeline::PipelineError;
use crate::shared::files::TextSource;
use crossbeam_channel::{Receiver, bounded};
use log::debug;
use std::thread::{self, JoinHandle};

type Batch = Result<Vec<Vec<u8>>, PipelineError>;

/// Reads a [`TextSource`] on a dedicated worker thread.
///
/// The worker hands over batches of owned lines through a bounded channel, so it runs
/// at most `queue_batches` batches ahead of the consumer. Lines arrive in their original
/// order. The worker stops when the stream ends, on the first read error (which is
/// forwarded), or as soon as the receiving side is dropped.
pub struct PrefetchTextSource {
    description: String,
    batch_lines: usize,
    queue_batches: usize,
    receiver: Option<Receiver<Batch>>,
    worker: Option<JoinHandle<Box<dyn TextSource>>>,
    idle: Option<Box<dyn TextSource>>,
    batch: Vec<Vec<u8>>,
    cursor: usize,
}

impl PrefetchTextSource {
    pub fn spawn(
        source: Box<dyn TextSource>,
        batch_lines: usize,
        queue_batches: usize,
    ) -> Result<Self, PipelineError> {
        let mut prefetch = Self {
            description: source.describe().to_string(),
            batch_lines: batch_lines.max(1),
            queue_batches: queue_batches.max(1),
            receiver: None,
            worker: None,
            idle: Some(source),
            batch: Vec::new(),
            cursor: 0,
        };
        prefetch.start()?;
        Ok(prefetch)
    }

    fn start(&mut self) -> Result<(), PipelineError> {
        let Some(mut source) = self.idle.take() else {
            return Err(PipelineError::Worker(format!(
                "prefetch worker for {} is already running",
                self.description
            )));
        };
        let (sender, receiver) = bounded::<Batch>(self.queue_batches);
        let batch_lines = self.batch_lines;
        let worker = thread::Builder::new()
            .name(format!("prefetch {}", self.description))
            .spawn(move || {
                loop {
                    let mut batch = Vec::with_capacity(batch_lines);
                    let mut finished = false;
                    while batch.len() < batch_lines {
                        match source.next_line() {
                            Ok(Some(line)) => batch.push(line.to_vec()),
                            Ok(None) => {
                                finished = true;
                                break;
                            }
                            Err(e) => {
                                let _ = sender.send(Err(e));
                                return source;
                            }
                        }
                    }
                    if !batch.is_empty() && sender.send(Ok(batch)).is_err() {
                        return source;
                    }
                    if finished {
                        return source;
                    }
                }
            })
            .map_err(|e| {
                PipelineError::Worker(format!(
                    "spawning prefetch worker for {}: {e}",
                    self.description
                ))
            })?;
        debug!("Prefetching {} on a worker thread", self.description);
        self.receiver = Some(receiver);
        self.worker = Some(worker);
        self.batch.clear();
        self.cursor = 0;
        Ok(())
    }

    /// Stops the worker and takes the inner source back.
    fn stop(&mut self) -> Result<(), PipelineError> {
        self.receiver = None;
        if let Some(worker) = self.worker.take() {
            let source = worker.join().map_err(|_| {
                PipelineError::Worker(format!("prefetch worker for {} panicked", self.description))
            })?;
            self.idle = Some(source);
        }
        Ok(())
    }
}

impl TextSource for PrefetchTextSource {
    fn next_line<'a>(&'a mut self) -> Result<Option<&'a [u8]>, PipelineError> {
        loop {
            if self.cursor < self.batch.len() {
                let line = self.cursor;
                self.cursor += 1;
                return Ok(Some(&self.batch[line]));
            }

            let Some(receiver) = self.receiver.as_ref() else {
                return Ok(None);
            };
            match receiver.recv() {
                Ok(Ok(batch)) => {
                    self.batch = batch;
                    self.cursor = 0;
                }
                Ok(Err(e)) => {
                    self.stop()?;
                    return Err(e);
                }
                Err(_) => {
                    // The worker hung up: the stream ended or the worker died.
                    self.stop()?;
                    return Ok(None);
                }
            }
        }
    }

    fn rewind(&mut self) -> Result<(), PipelineError> {
        self.stop()?;
        if let Some(source) = self.idle.as_mut() {
            source.rewind()?;
        }
        self.start()
    }

    fn describe(&self) -> &str {
        &self.description
    }
}

impl Drop for PrefetchTextSource {
    fn drop(&mut self) {
        self.receiver = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::files::{ByteSource, DecodingTextSource, InMemory};
    use std::sync::Arc;

    fn source(text: &str) -> Box<dyn TextSource> {
        let bytes: Arc<dyn ByteSource> =
            Arc::new(InMemory::new("prefetched", text.as_bytes().to_vec()));
        Box::new(DecodingTextSource::new(bytes, 7).expect("open"))
    }

    fn collect(source: &mut dyn TextSource) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = source.next_line().expect("next") {
            lines.push(String::from_utf8(line.to_vec()).expect("utf8"));
        }
        lines
    }

    #[test]
    fn prefetching_preserves_order_across_batches() {
        let text: String = (0..100).map(|i| format!("line {i}\n")).collect();
        let mut direct = source(&text);
        let mut prefetched = PrefetchTextSource::spawn(source(&text), 3, 2).expect("spawn");
        assert_eq!(collect(&mut prefetched), collect(direct.as_mut()));
        assert!(prefetched.next_line().expect("after end").is_none());
    }

    #[test]
    fn rewinding_restarts_the_worker() {
        let mut prefetched = PrefetchTextSource::spawn(source("a\nb\nc\n"), 1, 1).expect("spawn");
        assert_eq!(prefetched.next_line().expect("a"), Some(&b"a"[..]));
        prefetched.rewind().expect("rewind mid-stream");
        assert_eq!(collect(&mut prefetched), vec!["a", "b", "c"]);
        prefetched.rewind().expect("rewind at end");
        assert_eq!(collect(&mut prefetched), vec!["a", "b", "c"]);
        assert_eq!(prefetched.describe(), "prefetched");
    }

    #[test]
    fn dropping_mid_stream_stops_the_worker() {
        let text: String = (0..1000).map(|i| format!("{i}\n")).collect();
        let mut prefetched = PrefetchTextSource::spawn(source(&text), 4, 1).expect("spawn");
        assert!(prefetched.next_line().expect("first").is_some());
        drop(prefetched);
    }
}
