//! Collector configuration.
//!
//! The configuration file is a JSON document following the
//! [`swarm_json::Config`] schema. This module loads it and validates it,
//! producing a [`Quadrant`], which holds everything that is derived from the
//! configuration: the correlation order, the decoder, the packet geometry and
//! the sideband state table.

use crate::decoder::{Decoder, SpectralGeometry};
use crate::input::SignalInput;
use crate::order::{CorrelationOrder, InputSlot};
use crate::reassembly::PacketGeometry;
use crate::walsh::{SidebandStateTable, WalshPatterns};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use swarm_json::{Config, PacketProfile};

/// Loads the configuration file.
pub async fn load(path: &Path) -> Result<Config> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("failed to parse {}", path.display()))
}

/// Returns the packet geometry of a profile.
pub fn profile_geometry(profile: PacketProfile) -> PacketGeometry {
    match profile {
        PacketProfile::Production => PacketGeometry {
            payload_size: 8192,
            fragments: 512,
        },
        PacketProfile::Legacy => PacketGeometry {
            payload_size: 4096,
            fragments: 1024,
        },
    }
}

/// Validated correlator quadrant configuration.
#[derive(Debug, Clone)]
pub struct Quadrant {
    config: Config,
    fids: HashMap<IpAddr, usize>,
    slots: Vec<InputSlot>,
    order: CorrelationOrder,
    decoder: Decoder,
    packet: PacketGeometry,
    walsh: WalshPatterns,
    sideband_states: Option<SidebandStateTable>,
    eviction_timeout: Duration,
}

impl Quadrant {
    /// Validates a configuration.
    ///
    /// Fails if the members are not a power of two, if their FIDs are not
    /// `0..n` or their addresses are repeated, if the channels cannot be
    /// distributed among the members, or if the node buffer size implied by
    /// the correlation order does not match the packet geometry.
    pub fn new(config: Config) -> Result<Quadrant> {
        let n = config.members.len();
        anyhow::ensure!(
            n >= 2 && n.is_power_of_two(),
            "the number of members ({n}) must be a power of 2 greater or equal than 2"
        );

        let mut members: Vec<_> = config.members.iter().collect();
        members.sort_by_key(|m| m.fid);
        let mut fids = HashMap::new();
        for (fid, member) in members.iter().enumerate() {
            anyhow::ensure!(
                member.fid as usize == fid,
                "member FIDs must be 0 to {} without repetition (found FID {} at position {fid})",
                n - 1,
                member.fid
            );
            if fids.insert(member.address, fid).is_some() {
                anyhow::bail!("address {} is used by more than one member", member.address);
            }
        }
        let slots: Vec<InputSlot> = members
            .iter()
            .map(|m| [SignalInput::from(m.inputs[0]), SignalInput::from(m.inputs[1])])
            .collect();
        let inputs: Vec<SignalInput> = slots.iter().flatten().copied().collect();
        for input in inputs.iter().filter(|i| !i.is_valid()) {
            tracing::info!(%input, "unpopulated input");
        }

        let order = CorrelationOrder::new(&slots)?;
        let geometry = SpectralGeometry {
            channels: config.channels as usize,
            fids: n,
            parallel_channels: config.parallel_channels as usize,
        };
        let decoder = Decoder::new(geometry, &order, &inputs)?;
        if let Some(xeng_words) = config.xeng_words {
            anyhow::ensure!(
                xeng_words as usize == decoder.words(),
                "the X-engine is configured with {xeng_words} words per channel, \
                 but the correlation order has {} words",
                decoder.words()
            );
        }

        let defaults = profile_geometry(config.profile);
        let packet = PacketGeometry {
            payload_size: config
                .payload_size
                .map_or(defaults.payload_size, |x| x as usize),
            fragments: config.fragments.map_or(defaults.fragments, |x| x as usize),
        };
        anyhow::ensure!(
            packet.payload_size > 0 && packet.fragments > 0,
            "payload size and fragments must be positive"
        );
        anyhow::ensure!(
            packet.buffer_size() == decoder.node_buffer_size(),
            "{} fragments of {} bytes do not match the node buffer size of {} bytes \
             ({} channels per FID, {} words per channel)",
            packet.fragments,
            packet.payload_size,
            decoder.node_buffer_size(),
            geometry.channels_per_node(),
            decoder.words()
        );

        anyhow::ensure!(
            config.eviction_timeout.is_finite() && config.eviction_timeout > 0.0,
            "eviction timeout must be positive"
        );
        let eviction_timeout = Duration::from_secs_f64(config.eviction_timeout);

        let walsh = WalshPatterns::try_from(config.walsh.patterns.as_slice())?;
        let sideband_states = if config.walsh.patterns.is_empty() {
            tracing::warn!("no Walsh patterns configured");
            None
        } else {
            Some(
                SidebandStateTable::new(
                    order.xeng(),
                    &walsh,
                    config.walsh.period as usize,
                    config.walsh.skip as usize,
                )
                .context("failed to compute sideband state table")?,
            )
        };

        Ok(Quadrant {
            config,
            fids,
            slots,
            order,
            decoder,
            packet,
            walsh,
            sideband_states,
            eviction_timeout,
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the number of FIDs.
    pub fn num_fids(&self) -> usize {
        self.slots.len()
    }

    /// Returns the FID of the member that sends data from `address`.
    pub fn fid(&self, address: IpAddr) -> Option<usize> {
        self.fids.get(&address).copied()
    }

    /// Returns the map from sender address to FID.
    pub fn fids(&self) -> &HashMap<IpAddr, usize> {
        &self.fids
    }

    /// Returns the input slots in FID order.
    pub fn slots(&self) -> &[InputSlot] {
        &self.slots
    }

    /// Returns the correlation order.
    pub fn order(&self) -> &CorrelationOrder {
        &self.order
    }

    /// Returns the decoder.
    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    /// Returns the packet geometry.
    pub fn packet(&self) -> PacketGeometry {
        self.packet
    }

    /// Returns the Walsh patterns.
    pub fn walsh(&self) -> &WalshPatterns {
        &self.walsh
    }

    /// Returns the sideband state table.
    ///
    /// This is `None` if no Walsh patterns are configured.
    pub fn sideband_states(&self) -> Option<&SidebandStateTable> {
        self.sideband_states.as_ref()
    }

    /// Returns the time after which incomplete accumulations are evicted.
    pub fn eviction_timeout(&self) -> Duration {
        self.eviction_timeout
    }

    /// Returns the configuration summary of the API.
    pub fn api(&self, counters: swarm_json::Counters) -> swarm_json::Api {
        swarm_json::Api {
            profile: self.config.profile,
            payload_size: self.packet.payload_size as u32,
            fragments: self.packet.fragments as u32,
            fids: self.num_fids() as u32,
            channels: self.config.channels,
            packet_words: self.decoder.words() as u32,
            counters,
        }
    }
}
