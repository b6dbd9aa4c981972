//! HTTP server.
//!
//! This module contains the diagnostics HTTP server of the collector, which is
//! implemented using [`axum`]. It serves a JSON API with the configuration
//! summary and the counters, and streams the decoded visibilities to clients
//! using WebSockets.

use crate::app::AppState;
use anyhow::Result;
use axum::{routing::get, Router};
use bytes::Bytes;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

mod api;
mod websocket;

/// HTTP server.
#[derive(Debug)]
pub struct Server {
    server: axum::serve::Serve<Router, Router>,
}

impl Server {
    /// Creates a new HTTP server.
    ///
    /// The `address` parameter gives the address in which the server will
    /// listen. The `visibilities_sender` is used to obtain receivers for the
    /// visibilities websocket.
    ///
    /// After calling this function, the server needs to be run by calling
    /// [`Server::run`].
    pub async fn new(
        address: std::net::SocketAddr,
        state: AppState,
        visibilities_sender: broadcast::Sender<Bytes>,
    ) -> Result<Server> {
        let app = router(state, visibilities_sender);
        tracing::info!(%address, "starting HTTP server");
        let listener = tokio::net::TcpListener::bind(address).await?;
        let server = axum::serve(listener, app.layer(TraceLayer::new_for_http()));
        Ok(Server { server })
    }

    /// Runs the HTTP server.
    ///
    /// This only returns if there is a fatal error.
    pub async fn run(self) -> Result<()> {
        Ok(self.server.await?)
    }
}

fn router(state: AppState, visibilities_sender: broadcast::Sender<Bytes>) -> Router {
    Router::new()
        .route("/api", get(api::get_api).with_state(state.clone()))
        .route(
            "/api/sideband_states",
            get(api::get_sideband_states).with_state(state),
        )
        .route(
            "/visibilities",
            get(websocket::handler).with_state(visibilities_sender),
        )
}

mod json_error {
    use anyhow::Error;
    use axum::{
        http::StatusCode,
        response::{IntoResponse, Response},
    };
    use serde::Serialize;

    #[derive(Serialize, Debug, Clone, Eq, PartialEq)]
    pub struct JsonError {
        http_status_code: u16,
        error_description: String,
    }

    impl JsonError {
        pub fn from_error(status_code: StatusCode, error: Error) -> JsonError {
            JsonError {
                http_status_code: status_code.as_u16(),
                error_description: format!("{error:#}"),
            }
        }

        pub fn not_found(error: Error) -> JsonError {
            JsonError::from_error(StatusCode::NOT_FOUND, error)
        }
    }

    impl IntoResponse for JsonError {
        fn into_response(self) -> Response {
            let status_code = StatusCode::from_u16(self.http_status_code)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status_code, axum::Json(self)).into_response()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Quadrant;
    use crate::stats::Counters;
    use std::sync::Arc;
    use swarm_json::{Config, Input, Member, PacketProfile, Walsh, WalshPattern};

    fn state(patterns: Vec<WalshPattern>) -> AppState {
        let member = |fid: u8| Member {
            fid: fid.into(),
            address: [10, 0, 0, fid + 1].into(),
            host: None,
            inputs: [0, 1].map(|polarization| Input {
                antenna: Some(fid),
                chunk: Some(0),
                polarization: Some(polarization),
            }),
        };
        let config = Config {
            members: vec![member(0), member(1)],
            channels: 16,
            parallel_channels: 4,
            profile: PacketProfile::Legacy,
            payload_size: Some(256),
            fragments: Some(4),
            xeng_words: None,
            walsh: Walsh {
                period: 4,
                skip: 1,
                patterns,
            },
            eviction_timeout: 10.0,
        };
        let counters = Arc::new(Counters::default());
        counters.datagrams(12);
        AppState::new(Arc::new(Quadrant::new(config).unwrap()), counters)
    }

    async fn serve(state: AppState) -> std::net::SocketAddr {
        let (sender, _) = broadcast::channel(1);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router(state, sender)).await });
        address
    }

    async fn get(address: std::net::SocketAddr, path: &str) -> (u16, serde_json::Value) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = tokio::net::TcpStream::connect(address).await.unwrap();
        stream
            .write_all(
                format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                    .as_bytes(),
            )
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        let status = response[9..12].parse().unwrap();
        let (_, body) = response.split_once("\r\n\r\n").unwrap();
        (status, serde_json::from_str(body).unwrap())
    }

    #[tokio::test]
    async fn api() {
        let address = serve(state(Vec::new())).await;
        let (status, api) = get(address, "/api").await;
        assert_eq!(status, 200);
        let api: swarm_json::Api = serde_json::from_value(api).unwrap();
        assert_eq!(api.profile, PacketProfile::Legacy);
        assert_eq!(api.fids, 2);
        assert_eq!(api.packet_words, 32);
        assert_eq!(api.counters.datagrams, 12);
        let (status, error) = get(address, "/api/sideband_states").await;
        assert_eq!(status, 404);
        assert_eq!(error["http_status_code"], 404);
    }

    #[tokio::test]
    async fn sideband_states() {
        let patterns = [(0, "00"), (1, "01")]
            .map(|(antenna, pattern)| WalshPattern {
                antenna,
                pattern: pattern.to_string(),
            })
            .to_vec();
        let address = serve(state(patterns)).await;
        let (status, states) = get(address, "/api/sideband_states").await;
        assert_eq!(status, 200);
        let states: swarm_json::SidebandStates = serde_json::from_value(states).unwrap();
        assert_eq!(states.skip, 1);
        assert_eq!(states.states.len(), 4);
        assert!(states.states.iter().all(|row| row.len() == 8));
    }
}
