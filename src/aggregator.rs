//! Accumulation aggregator.
//!
//! The aggregator receives the node buffers produced by the receiver, groups
//! them by accumulation sequence and, once every FID has reported, decodes
//! the accumulation and hands it to the observers.

use crate::config::Quadrant;
use crate::decoder::Decoded;
use crate::observer::Observers;
use crate::reassembly::NodeBuffer;
use crate::stats::Counters;
use anyhow::Result;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Period with which stale accumulations are evicted.
const EVICTION_PERIOD: Duration = Duration::from_millis(500);

/// Accumulation aggregator.
#[derive(Debug)]
pub struct Aggregator {
    quadrant: Arc<Quadrant>,
    receiver: mpsc::Receiver<NodeBuffer>,
    observers: Observers,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    pending: HashMap<u32, Accumulation>,
}

#[derive(Debug)]
struct Accumulation {
    buffers: Vec<Option<Bytes>>,
    received: usize,
    created: Instant,
    since_last: Option<Duration>,
}

impl Aggregator {
    /// Creates a new aggregator.
    ///
    /// Node buffers are received from `receiver`. Decoded accumulations are
    /// given to `observers`.
    pub fn new(
        quadrant: Arc<Quadrant>,
        receiver: mpsc::Receiver<NodeBuffer>,
        observers: Observers,
        counters: Arc<Counters>,
        cancel: CancellationToken,
    ) -> Aggregator {
        Aggregator {
            quadrant,
            receiver,
            observers,
            counters,
            cancel,
            pending: HashMap::new(),
        }
    }

    /// Returns the number of incomplete accumulations.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Runs the aggregator.
    ///
    /// When the cancellation token is cancelled, the node buffers that are
    /// already queued are processed, the incomplete accumulations are
    /// discarded, and the function returns.
    #[tracing::instrument(name = "aggregator", skip_all)]
    pub async fn run(mut self) -> Result<()> {
        let mut eviction = tokio::time::interval(EVICTION_PERIOD);
        eviction.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                buffer = self.receiver.recv() => match buffer {
                    Some(buffer) => self.push(buffer, Instant::now()),
                    None => break,
                },
                _ = eviction.tick() => {
                    self.evict(Instant::now());
                }
            }
        }
        self.receiver.close();
        while let Some(buffer) = self.receiver.recv().await {
            self.push(buffer, Instant::now());
        }
        self.shutdown();
        Ok(())
    }

    /// Processes a node buffer received at time `now`.
    ///
    /// If the buffer completes its accumulation, the accumulation is decoded
    /// and dispatched to the observers.
    pub fn push(&mut self, buffer: NodeBuffer, now: Instant) {
        let Some(fid) = self.quadrant.fid(buffer.sender.ip()) else {
            tracing::warn!(sender = %buffer.sender, sequence = buffer.sequence, "unknown sender");
            self.counters.unknown_senders(1);
            return;
        };
        let fids = self.quadrant.num_fids();
        let sequence = buffer.sequence;
        let accumulation = self
            .pending
            .entry(sequence)
            .or_insert_with(|| Accumulation {
                buffers: vec![None; fids],
                received: 0,
                created: now,
                since_last: None,
            });
        if accumulation.buffers[fid].replace(buffer.data).is_some() {
            tracing::warn!(sequence, fid, "replacing repeated node buffer");
        } else {
            accumulation.received += 1;
        }
        accumulation.since_last = buffer.since_last;
        if accumulation.received < fids {
            return;
        }
        if let Some(accumulation) = self.pending.remove(&sequence) {
            let buffers = accumulation.buffers.into_iter().flatten().collect::<Vec<_>>();
            self.complete(sequence, &buffers, accumulation.since_last);
        }
    }

    fn complete(&mut self, sequence: u32, buffers: &[Bytes], since_last: Option<Duration>) {
        let Decoded {
            mut package,
            errors,
        } = self.quadrant.decoder().decode(sequence, buffers);
        package.set_integration_time(since_last);
        tracing::debug!(sequence, errors, integration_time = ?since_last, "accumulation decoded");
        self.counters.accumulations(1);
        self.counters.decode_errors(errors as u64);
        self.observers.dispatch(buffers, &package);
    }

    /// Discards the incomplete accumulations created more than the eviction
    /// timeout before `now`.
    ///
    /// Returns the number of accumulations discarded.
    pub fn evict(&mut self, now: Instant) -> usize {
        let ttl = self.quadrant.eviction_timeout();
        let before = self.pending.len();
        self.pending.retain(|&sequence, accumulation| {
            let keep = now.saturating_duration_since(accumulation.created) < ttl;
            if !keep {
                tracing::warn!(
                    sequence,
                    received = accumulation.received,
                    "discarding stale accumulation"
                );
            }
            keep
        });
        let evicted = before - self.pending.len();
        self.counters.evicted_accumulations(evicted as u64);
        evicted
    }

    fn shutdown(&mut self) {
        for (sequence, accumulation) in self.pending.drain() {
            tracing::info!(
                sequence,
                received = accumulation.received,
                "discarding incomplete accumulation on shutdown"
            );
            self.counters.evicted_accumulations(1);
        }
        tracing::info!("aggregator stopped");
    }
}
