use std::time::{Duration, Instant};

/// Last result of a remote status query, reused until `wait` has elapsed.
#[derive(Debug)]
pub struct PollCache<T> {
    wait: Duration,
    entry: Option<(Instant, T)>,
}

impl<T> PollCache<T> {
    pub fn new(wait: Duration) -> Self {
        Self { wait, entry: None }
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// The cached value, if it was stored less than `wait` ago.
    pub fn fresh(&self) -> Option<&T> {
        match &self.entry {
            Some((at, value)) if at.elapsed() < self.wait => Some(value),
            _ => None,
        }
    }

    pub fn store(&mut self, value: T) {
        self.entry = Some((Instant::now(), value));
    }
}
