//! Progress aggregation and status rendering.
//!
//! The aggregator task owns the slot table; transfers hold an opaque slot
//! id and post events over a channel, never a reference into the table.
//! Once a second it assembles one line per active slot plus a totals line
//! with a weighted transfer rate and ETA. On a terminal the previous
//! status block is erased before the new one is drawn; elsewhere it
//! degrades to plain lines.

use crate::pipeline::{ProgressFn, TransferEvent, TransferState};
use std::collections::BTreeMap;
use std::io::{IsTerminal, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Rate windows and their weights: 1 s at 50%, 30 s at 30%, overall 20%.
const W_1S: f64 = 0.50;
const W_30S: f64 = 0.30;
const W_ALL: f64 = 0.20;
const SAMPLES: usize = 31;

enum Event {
    SetTotals { files: u64, bytes: u64 },
    Start { id: u64, path: String, total: u64 },
    Transfer { id: u64, event: TransferEvent },
    Skipped { id: u64, bytes: u64 },
    Finished { id: u64 },
    Aborted { id: u64 },
    Shutdown,
}

struct Slot {
    path: String,
    total: u64,
    done: u64,
    state: TransferState,
}

/// Cloneable posting side of the aggregator.
#[derive(Clone)]
pub struct ProgressHandle {
    tx: mpsc::UnboundedSender<Event>,
    next_id: Arc<AtomicU64>,
}

impl ProgressHandle {
    pub fn set_totals(&self, files: u64, bytes: u64) {
        let _ = self.tx.send(Event::SetTotals { files, bytes });
    }

    /// Register a transfer slot; the returned id is the only thing the
    /// transfer ever holds.
    pub fn start(&self, path: &str, total: u64) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(Event::Start {
            id,
            path: path.to_string(),
            total,
        });
        id
    }

    /// Progress callback bound to a slot, for handing to a pipeline.
    pub fn transfer_fn(&self, id: u64) -> ProgressFn {
        let tx = self.tx.clone();
        Arc::new(move |event| {
            let _ = tx.send(Event::Transfer { id, event });
        })
    }

    /// The file was skipped; its bytes count as done but not into the rate.
    pub fn skipped(&self, id: u64, bytes: u64) {
        let _ = self.tx.send(Event::Skipped { id, bytes });
    }

    pub fn finished(&self, id: u64) {
        let _ = self.tx.send(Event::Finished { id });
    }

    pub fn aborted(&self, id: u64) {
        let _ = self.tx.send(Event::Aborted { id });
    }
}

/// The aggregator task plus its handle.
pub struct ProgressAggregator {
    handle: ProgressHandle,
    task: JoinHandle<()>,
}

impl ProgressAggregator {
    /// Spawn the aggregator. With `enabled == false` events are drained
    /// but nothing is rendered.
    pub fn spawn(enabled: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ProgressHandle {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        let task = tokio::spawn(run(rx, enabled));
        Self { handle, task }
    }

    pub fn handle(&self) -> ProgressHandle {
        self.handle.clone()
    }

    /// Stop the 1 Hz loop and erase any status lines still on screen.
    pub async fn shutdown(self) {
        let _ = self.handle.tx.send(Event::Shutdown);
        let _ = self.task.await;
    }
}

struct State {
    slots: BTreeMap<u64, Slot>,
    total_files: u64,
    total_bytes: u64,
    done_files: u64,
    skipped_bytes: u64,
    transferred: u64,
    started: Instant,
    /// (seconds since start, transferred bytes) once per tick.
    samples: Vec<(f64, u64)>,
    drawn_lines: usize,
}

impl State {
    fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
            total_files: 0,
            total_bytes: 0,
            done_files: 0,
            skipped_bytes: 0,
            transferred: 0,
            started: Instant::now(),
            samples: Vec::new(),
            drawn_lines: 0,
        }
    }

    fn apply(&mut self, event: Event) {
        match event {
            Event::SetTotals { files, bytes } => {
                self.total_files = files;
                self.total_bytes = bytes;
            }
            Event::Start { id, path, total } => {
                self.slots.insert(
                    id,
                    Slot {
                        path,
                        total,
                        done: 0,
                        state: TransferState::Preparing,
                    },
                );
            }
            Event::Transfer { id, event } => {
                if let Some(slot) = self.slots.get_mut(&id) {
                    match event {
                        TransferEvent::Bytes(n) => {
                            slot.done += n;
                            self.transferred += n;
                        }
                        TransferEvent::State(s) => slot.state = s,
                    }
                }
            }
            Event::Skipped { id, bytes } => {
                self.slots.remove(&id);
                self.done_files += 1;
                self.skipped_bytes += bytes;
            }
            Event::Finished { id } => {
                self.slots.remove(&id);
                self.done_files += 1;
            }
            Event::Aborted { id } => {
                self.slots.remove(&id);
            }
            Event::Shutdown => {}
        }
    }

    fn tick(&mut self) {
        let elapsed = self.started.elapsed().as_secs_f64();
        self.samples.push((elapsed, self.transferred));
        if self.samples.len() > SAMPLES {
            let excess = self.samples.len() - SAMPLES;
            self.samples.drain(..excess);
        }
    }

    fn rate(&self) -> f64 {
        weighted_rate(
            &self.samples,
            self.started.elapsed().as_secs_f64(),
            self.transferred,
        )
    }

    fn status_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .slots
            .values()
            .map(|slot| {
                let pct = if slot.total > 0 {
                    (slot.done as f64 / slot.total as f64 * 100.0).min(100.0)
                } else {
                    0.0
                };
                format!(
                    "  {} {} / {} ({:.0}%) [{}]",
                    slot.path,
                    human_bytes(slot.done),
                    human_bytes(slot.total),
                    pct,
                    slot.state.label()
                )
            })
            .collect();

        let done_bytes = self.transferred + self.skipped_bytes;
        let rate = self.rate();
        let eta = if rate > 0.0 && self.total_bytes > done_bytes {
            human_duration((self.total_bytes - done_bytes) as f64 / rate)
        } else {
            "-".to_string()
        };
        lines.push(format!(
            "{}/{} files, {} / {}, {}/s, ETA {}",
            self.done_files,
            self.total_files,
            human_bytes(done_bytes),
            human_bytes(self.total_bytes),
            human_bytes(rate as u64),
            eta
        ));
        lines
    }

    fn render(&mut self) {
        let lines = self.status_lines();
        let mut err = std::io::stderr().lock();
        if err.is_terminal() {
            // erase the previous block, then draw the new one
            for _ in 0..self.drawn_lines {
                let _ = write!(err, "\x1b[1A\x1b[2K");
            }
            for line in &lines {
                let _ = writeln!(err, "{}", line);
            }
            self.drawn_lines = lines.len();
        } else if let Some(totals) = lines.last() {
            let _ = writeln!(err, "{}", totals);
            self.drawn_lines = 0;
        }
        let _ = err.flush();
    }

    fn clear(&mut self) {
        if self.drawn_lines == 0 {
            return;
        }
        let mut err = std::io::stderr().lock();
        if err.is_terminal() {
            for _ in 0..self.drawn_lines {
                let _ = write!(err, "\x1b[1A\x1b[2K");
            }
            let _ = err.flush();
        }
        self.drawn_lines = 0;
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Event>, enabled: bool) {
    let mut state = State::new();
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(Event::Shutdown) | None => break,
                    Some(event) => state.apply(event),
                }
            }
            _ = interval.tick() => {
                state.tick();
                if enabled {
                    state.render();
                }
            }
        }
    }
    state.clear();
}

/// The 3-term weighted rate over the 1 s, 30 s, and overall windows.
fn weighted_rate(samples: &[(f64, u64)], elapsed: f64, transferred: u64) -> f64 {
    let window = |back: usize| -> f64 {
        if samples.len() < 2 {
            return 0.0;
        }
        let last = samples[samples.len() - 1];
        let first = samples[samples.len() - 1 - back.min(samples.len() - 1)];
        let dt = last.0 - first.0;
        if dt <= 0.0 {
            return 0.0;
        }
        (last.1.saturating_sub(first.1)) as f64 / dt
    };

    let overall = if elapsed > 0.0 {
        transferred as f64 / elapsed
    } else {
        0.0
    };

    W_1S * window(1) + W_30S * window(30) + W_ALL * overall
}

/// `1023 B`, `4.2 MiB`, `1.3 GiB`...
pub fn human_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", n)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// `42s`, `3m12s`, `2h05m`...
pub fn human_duration(secs: f64) -> String {
    let secs = secs.round() as u64;
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(0), "0 B");
        assert_eq!(human_bytes(1023), "1023 B");
        assert_eq!(human_bytes(1536), "1.5 KiB");
        assert_eq!(human_bytes(100 * 1024 * 1024), "100.0 MiB");
    }

    #[test]
    fn test_human_duration() {
        assert_eq!(human_duration(42.0), "42s");
        assert_eq!(human_duration(192.0), "3m12s");
        assert_eq!(human_duration(7500.0), "2h05m");
    }

    #[test]
    fn test_weighted_rate_steady_stream() {
        // 100 B/s for 40 ticks: every window agrees
        let samples: Vec<(f64, u64)> = (0..40).map(|i| (i as f64, i as u64 * 100)).collect();
        let rate = weighted_rate(&samples, 39.0, 3900);
        assert!((rate - 100.0).abs() < 1.0, "rate was {}", rate);
    }

    #[test]
    fn test_weighted_rate_recent_burst_dominates() {
        // idle for 30 ticks, then 1000 B in the last second
        let mut samples: Vec<(f64, u64)> = (0..31).map(|i| (i as f64, 0)).collect();
        samples.push((31.0, 1000));
        let rate = weighted_rate(&samples, 31.0, 1000);
        // 1 s window sees 1000 B/s and carries half the weight
        assert!(rate > 500.0, "rate was {}", rate);
        assert!(rate < 600.0, "rate was {}", rate);
    }

    #[test]
    fn test_weighted_rate_empty() {
        assert_eq!(weighted_rate(&[], 0.0, 0), 0.0);
        assert_eq!(weighted_rate(&[(0.0, 0)], 0.0, 0), 0.0);
    }

    #[tokio::test]
    async fn test_slot_lifecycle() {
        let mut state = State::new();
        state.apply(Event::SetTotals { files: 2, bytes: 200 });
        state.apply(Event::Start {
            id: 1,
            path: "a/1".to_string(),
            total: 100,
        });
        state.apply(Event::Transfer {
            id: 1,
            event: TransferEvent::Bytes(40),
        });
        assert_eq!(state.slots.len(), 1);
        assert_eq!(state.transferred, 40);

        let lines = state.status_lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("a/1"));
        assert!(lines[1].starts_with("0/2 files"));

        state.apply(Event::Finished { id: 1 });
        assert_eq!(state.slots.len(), 0);
        assert_eq!(state.done_files, 1);
    }

    #[tokio::test]
    async fn test_skipped_bytes_count_done_but_not_rate() {
        let mut state = State::new();
        state.apply(Event::SetTotals { files: 1, bytes: 100 });
        state.apply(Event::Start {
            id: 1,
            path: "a".to_string(),
            total: 100,
        });
        state.apply(Event::Skipped { id: 1, bytes: 100 });
        assert_eq!(state.transferred, 0);
        assert_eq!(state.skipped_bytes, 100);
        let lines = state.status_lines();
        assert!(lines.last().unwrap().starts_with("1/1 files, 100 B / 100 B"));
    }
}
