//! UDP receiver.
//!
//! The receiver listens on a UDP socket, feeds the datagrams into a
//! [`Reassembler`] and sends the complete node buffers to the aggregator
//! through an mpsc channel.

use crate::reassembly::{NodeBuffer, PacketGeometry, Push, Reassembler, Rejection};
use crate::stats::Counters;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Maximum time that the receiver waits for a datagram.
///
/// This bounds the time that it takes to notice cancellation and to evict
/// stale buffers when no data is arriving.
pub const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// UDP receiver.
#[derive(Debug)]
pub struct Receiver {
    socket: UdpSocket,
    reassembler: Reassembler,
    sender: mpsc::Sender<NodeBuffer>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl Receiver {
    /// Creates a receiver listening on `listen`.
    ///
    /// Complete node buffers are sent to `sender`. Incomplete buffers are
    /// discarded after `ttl`.
    pub async fn bind(
        listen: SocketAddr,
        geometry: PacketGeometry,
        ttl: Duration,
        sender: mpsc::Sender<NodeBuffer>,
        counters: Arc<Counters>,
        cancel: CancellationToken,
    ) -> Result<Receiver> {
        let socket = UdpSocket::bind(listen)
            .await
            .with_context(|| format!("failed to bind UDP socket to {listen}"))?;
        tracing::info!(%listen, ?geometry, "UDP receiver listening");
        Ok(Receiver {
            socket,
            reassembler: Reassembler::new(geometry, ttl),
            sender,
            counters,
            cancel,
        })
    }

    /// Returns the local address of the socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Runs the receiver.
    ///
    /// This function returns when the cancellation token is cancelled, when
    /// the aggregator stops receiving node buffers, or if there is a fatal
    /// error.
    #[tracing::instrument(name = "receiver", skip_all)]
    pub async fn run(mut self) -> Result<()> {
        // One extra byte so that oversized datagrams are detected.
        let mut buf = vec![0u8; self.reassembler.geometry().datagram_size() + 1];
        let mut last_eviction = Instant::now();
        loop {
            let recv = tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!(pending = self.reassembler.pending(), "receiver stopped");
                    return Ok(());
                }
                recv = tokio::time::timeout(RECV_TIMEOUT, self.socket.recv_from(&mut buf)) => recv,
            };
            let now = Instant::now();
            match recv {
                Err(_) => {
                    self.evict(now);
                    last_eviction = now;
                    continue;
                }
                Ok(Err(err)) => tracing::warn!("UDP receive error: {err}"),
                Ok(Ok((len, sender))) => {
                    self.counters.datagrams(1);
                    if let Some(buffer) = self.push(sender, &buf[..len], now) {
                        if self.sender.send(buffer).await.is_err() {
                            tracing::info!("aggregator has stopped; stopping receiver");
                            return Ok(());
                        }
                    }
                }
            }
            if now.saturating_duration_since(last_eviction) >= RECV_TIMEOUT {
                self.evict(now);
                last_eviction = now;
            }
        }
    }

    fn push(&mut self, sender: SocketAddr, datagram: &[u8], now: Instant) -> Option<NodeBuffer> {
        match self.reassembler.push(sender, datagram, now) {
            Push::Pending => None,
            Push::Complete(buffer) => {
                tracing::trace!(
                    %sender,
                    sequence = buffer.sequence,
                    since_last = ?buffer.since_last,
                    "node buffer complete"
                );
                self.counters.node_buffers(1);
                Some(buffer)
            }
            Push::Rejected(rejection) => {
                match rejection {
                    Rejection::Size(size) => tracing::warn!(
                        %sender,
                        size,
                        expected = self.reassembler.geometry().datagram_size(),
                        "discarding datagram with wrong size"
                    ),
                    Rejection::Fragment(fragment) => tracing::warn!(
                        %sender,
                        fragment,
                        fragments = self.reassembler.geometry().fragments,
                        "discarding datagram with invalid fragment index"
                    ),
                }
                self.counters.malformed_datagrams(1);
                None
            }
        }
    }

    fn evict(&mut self, now: Instant) {
        let evicted = self.reassembler.evict(now);
        if evicted > 0 {
            tracing::warn!(evicted, "discarded incomplete node buffers");
            self.counters.evicted_node_buffers(evicted as u64);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::reassembly::FragmentHeader;

    const GEOMETRY: PacketGeometry = PacketGeometry {
        payload_size: 16,
        fragments: 3,
    };

    fn datagram(fragment: u32, sequence: u32) -> Vec<u8> {
        let mut d = FragmentHeader { fragment, sequence }.to_bytes().to_vec();
        d.extend(std::iter::repeat(fragment as u8).take(GEOMETRY.payload_size));
        d
    }

    #[tokio::test]
    async fn receive() {
        let counters = Arc::new(Counters::default());
        let cancel = CancellationToken::new();
        let (sender, mut receiver) = mpsc::channel(4);
        let rx = Receiver::bind(
            "127.0.0.1:0".parse().unwrap(),
            GEOMETRY,
            Duration::from_secs(10),
            sender,
            Arc::clone(&counters),
            cancel.clone(),
        )
        .await
        .unwrap();
        let addr = rx.local_addr().unwrap();
        let task = tokio::spawn(rx.run());

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for fragment in [2, 0, 0] {
            socket.send_to(&datagram(fragment, 9), addr).await.unwrap();
        }
        // malformed datagrams
        socket.send_to(&datagram(3, 9), addr).await.unwrap();
        socket.send_to(&datagram(1, 9)[..10], addr).await.unwrap();
        socket.send_to(&datagram(1, 9), addr).await.unwrap();

        let buffer = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buffer.sender, socket.local_addr().unwrap());
        assert_eq!(buffer.sequence, 9);
        assert_eq!(buffer.since_last, None);
        assert_eq!(buffer.data.len(), GEOMETRY.buffer_size());
        assert_eq!(&buffer.data[..], &[[0u8; 16], [1; 16], [2; 16]].concat()[..]);

        cancel.cancel();
        task.await.unwrap().unwrap();
        let counters = counters.snapshot();
        assert_eq!(counters.datagrams, 6);
        assert_eq!(counters.malformed_datagrams, 2);
        assert_eq!(counters.node_buffers, 1);
    }

    #[tokio::test]
    async fn stops_without_aggregator() {
        let (sender, receiver) = mpsc::channel(1);
        drop(receiver);
        let rx = Receiver::bind(
            "127.0.0.1:0".parse().unwrap(),
            PacketGeometry {
                payload_size: 4,
                fragments: 1,
            },
            Duration::from_secs(10),
            sender,
            Arc::new(Counters::default()),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let addr = rx.local_addr().unwrap();
        let task = tokio::spawn(rx.run());
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut d = FragmentHeader {
            fragment: 0,
            sequence: 0,
        }
        .to_bytes()
        .to_vec();
        d.extend([0; 4]);
        socket.send_to(&d, addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
