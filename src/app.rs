//! swarm-collector application.
//!
//! This module contains a top-level structure [`App`] that represents the whole
//! collector application and a structure [`AppState`] that contains the state
//! shared with the HTTP server.

use crate::{
    aggregator::Aggregator,
    args::Args,
    config::{self, Quadrant},
    control::{ControlPlane, NodeGroup},
    httpd,
    observer::{BroadcastSink, Observers, RampChecker, SinkObserver},
    receiver::Receiver,
    stats::Counters,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

// Node buffers queued between the receiver and the aggregator
const NODE_BUFFER_QUEUE: usize = 64;
// Visibilities queued for each websocket client
const VISIBILITIES_QUEUE: usize = 4096;

/// swarm-collector application.
///
/// This struct represents the collector application. It owns the different
/// objects of which the application is formed, and runs them concurrently.
#[derive(Debug)]
pub struct App {
    httpd: httpd::Server,
    receiver: Receiver,
    aggregator: Aggregator,
    cancel: CancellationToken,
}

impl App {
    /// Creates a new application that does not program the correlator members.
    ///
    /// The members must have been programmed by other means.
    #[tracing::instrument(name = "App::new", level = "debug")]
    pub async fn new(args: &Args) -> Result<App> {
        let quadrant = load_quadrant(args).await?;
        tracing::warn!("no control plane configured; correlator members are not programmed");
        App::build(args, quadrant).await
    }

    /// Creates a new application that programs the correlator members.
    ///
    /// The FIDs of the members are checked, and the Walsh patterns and the
    /// sideband state table are loaded through `plane` before the data
    /// receiver is started.
    #[tracing::instrument(name = "App::with_control_plane", level = "debug", skip(plane))]
    pub async fn with_control_plane<C: ControlPlane>(args: &Args, plane: C) -> Result<App> {
        let quadrant = load_quadrant(args).await?;
        let nodes = NodeGroup::new(plane, quadrant.config().members.clone());
        nodes
            .program(quadrant.walsh(), quadrant.sideband_states())
            .await
            .context("failed to program the correlator members")?;
        App::build(args, quadrant).await
    }

    async fn build(args: &Args, quadrant: Arc<Quadrant>) -> Result<App> {
        let counters = Arc::new(Counters::default());
        let cancel = CancellationToken::new();

        let (visibilities_sender, _) = broadcast::channel(VISIBILITIES_QUEUE);
        let mut observers = Observers::new(Arc::clone(&counters));
        if args.ramp_check {
            observers.add_raw(RampChecker::new(
                quadrant.decoder().geometry().parallel_channels,
                quadrant.decoder().words(),
                Arc::clone(&counters),
            ));
        }
        observers.add_data(SinkObserver::new(BroadcastSink::new(
            visibilities_sender.clone(),
        )));

        let (buffer_sender, buffer_receiver) = mpsc::channel(NODE_BUFFER_QUEUE);
        let receiver = Receiver::bind(
            args.listen,
            quadrant.packet(),
            quadrant.eviction_timeout(),
            buffer_sender,
            Arc::clone(&counters),
            cancel.clone(),
        )
        .await?;
        let aggregator = Aggregator::new(
            Arc::clone(&quadrant),
            buffer_receiver,
            observers,
            Arc::clone(&counters),
            cancel.clone(),
        );

        let state = AppState::new(quadrant, counters);
        let httpd = httpd::Server::new(args.http, state, visibilities_sender).await?;

        Ok(App {
            httpd,
            receiver,
            aggregator,
            cancel,
        })
    }

    /// Runs the application.
    ///
    /// This returns when the collector is stopped with Ctrl-C, after the
    /// pending node buffers have been processed, or if one of the objects
    /// that form the application fails.
    #[tracing::instrument(name = "App::run", level = "debug", skip_all)]
    pub async fn run(self) -> Result<()> {
        let App {
            httpd,
            receiver,
            aggregator,
            cancel,
        } = self;
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("received Ctrl-C; stopping");
                    cancel.cancel();
                }
                Err(error) => tracing::error!(%error, "unable to listen for Ctrl-C"),
            }
        });
        let pipeline = async move {
            let (receiver, aggregator) = tokio::join!(receiver.run(), aggregator.run());
            receiver.and(aggregator)
        };
        tokio::select! {
            ret = httpd.run() => ret,
            ret = pipeline => ret,
        }
    }
}

async fn load_quadrant(args: &Args) -> Result<Arc<Quadrant>> {
    let config = config::load(&args.config).await?;
    let quadrant = Quadrant::new(config).context("invalid collector configuration")?;
    tracing::info!(
        fids = quadrant.num_fids(),
        channels = quadrant.config().channels,
        packet_words = quadrant.decoder().words(),
        baselines = quadrant.decoder().baselines().len(),
        profile = %quadrant.config().profile,
        payload_size = quadrant.packet().payload_size,
        fragments = quadrant.packet().fragments,
        "configuration loaded"
    );
    for (fid, slot) in quadrant.slots().iter().enumerate() {
        tracing::debug!(fid, input0 = %slot[0], input1 = %slot[1], "input slot");
    }
    Ok(Arc::new(quadrant))
}

/// Application state.
///
/// This struct contains the application state that needs to be shared with
/// the Axum handlers of the HTTP server. The struct behaves as an `Arc<...>`.
/// It is cheaply clonable and clones represent a reference to a shared object.
#[derive(Debug, Clone)]
pub struct AppState(Arc<State>);

#[derive(Debug)]
struct State {
    quadrant: Arc<Quadrant>,
    counters: Arc<Counters>,
}

impl AppState {
    /// Creates the application state.
    pub fn new(quadrant: Arc<Quadrant>, counters: Arc<Counters>) -> AppState {
        AppState(Arc::new(State { quadrant, counters }))
    }

    /// Gives access to the validated configuration.
    pub fn quadrant(&self) -> &Quadrant {
        &self.0.quadrant
    }

    /// Gives access to the collector counters.
    pub fn counters(&self) -> &Counters {
        &self.0.counters
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::control::{RegisterFile, FID, SB_STATES, WALSH_TABLE};
    use serde_json::json;

    async fn args(name: &str) -> Args {
        let config = json!({
            "members": [
                {
                    "fid": 0,
                    "address": "127.0.0.1",
                    "host": "roach0",
                    "inputs": [
                        {"antenna": 1, "chunk": 0, "polarization": 0},
                        {"antenna": 1, "chunk": 0, "polarization": 1}
                    ]
                },
                {
                    "fid": 1,
                    "address": "127.0.0.2",
                    "inputs": [
                        {"antenna": 2, "chunk": 0, "polarization": 0},
                        {"antenna": 2, "chunk": 0, "polarization": 1}
                    ]
                }
            ],
            "channels": 16,
            "parallel_channels": 4,
            "payload_size": 256,
            "fragments": 4,
            "walsh": {
                "period": 4,
                "skip": 1,
                "patterns": [
                    {"antenna": 1, "pattern": "00"},
                    {"antenna": 2, "pattern": "01"}
                ]
            }
        });
        let path = std::env::temp_dir().join(format!(
            "swarm-app-{name}-{}.json",
            std::process::id()
        ));
        tokio::fs::write(&path, serde_json::to_vec(&config).unwrap())
            .await
            .unwrap();
        Args {
            config: path,
            listen: "127.0.0.1:0".parse().unwrap(),
            http: "127.0.0.1:0".parse().unwrap(),
            ramp_check: false,
        }
    }

    fn registers() -> Arc<RegisterFile> {
        let regs = RegisterFile::new();
        regs.set("roach0", FID, &0u32.to_be_bytes());
        regs.set("127.0.0.2", FID, &1u32.to_be_bytes());
        Arc::new(regs)
    }

    #[tokio::test]
    async fn programs_injected_plane() {
        let args = args("program").await;
        let regs = registers();
        App::with_control_plane(&args, Arc::clone(&regs))
            .await
            .unwrap();
        tokio::fs::remove_file(&args.config).await.unwrap();
        assert_eq!(regs.get("roach0", WALSH_TABLE), Some(vec![0, 0]));
        assert_eq!(regs.get("127.0.0.2", WALSH_TABLE), Some(vec![0, 1]));
        let states = regs.get("roach0", SB_STATES).unwrap();
        assert!(!states.is_empty());
        assert_eq!(regs.get("127.0.0.2", SB_STATES), Some(states));
    }

    #[tokio::test]
    async fn fid_mismatch() {
        let args = args("fid").await;
        let regs = registers();
        regs.set("127.0.0.2", FID, &3u32.to_be_bytes());
        let err = App::with_control_plane(&args, Arc::clone(&regs))
            .await
            .unwrap_err();
        tokio::fs::remove_file(&args.config).await.unwrap();
        assert!(format!("{err:#}").contains("FID 3"), "{err:#}");
        assert_eq!(regs.get("roach0", WALSH_TABLE), None);
    }

    #[tokio::test]
    async fn without_control_plane() {
        let args = args("plain").await;
        let app = App::new(&args).await;
        tokio::fs::remove_file(&args.config).await.unwrap();
        assert!(app.is_ok());
    }
}
