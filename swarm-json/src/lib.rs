//! swarm-json contains the JSON schemas used by the SWARM collector: the
//! configuration file, the diagnostics API and the visibilities stream.

#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Collector configuration JSON schema.
///
/// This JSON schema corresponds to the configuration file given with
/// `--config`. It describes the correlator quadrant: its members (one per
/// FID), the spectral geometry and the packet format.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    /// Correlator members, one per FID.
    pub members: Vec<Member>,
    /// Number of spectral channels per chunk and sideband.
    pub channels: u32,
    /// Number of channels processed in parallel by the X-engine.
    #[serde(default = "default_parallel_channels")]
    pub parallel_channels: u32,
    /// Packet format profile.
    #[serde(default)]
    pub profile: PacketProfile,
    /// Payload size override in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<u32>,
    /// Fragment count override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragments: Option<u32>,
    /// Number of words per channel emitted by the X-engine firmware.
    ///
    /// When present, it is checked against the length of the packet order
    /// computed from the members.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xeng_words: Option<u32>,
    /// Walsh modulation settings.
    #[serde(default)]
    pub walsh: Walsh,
    /// Time after which incomplete accumulations are discarded, in seconds.
    #[serde(default = "default_eviction_timeout")]
    pub eviction_timeout: f64,
}

fn default_parallel_channels() -> u32 {
    8
}

fn default_eviction_timeout() -> f64 {
    10.0
}

/// Correlator member JSON schema.
///
/// A member is one FPGA processing node. It digitizes two inputs and
/// computes the correlation of a subset of the channels.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Member {
    /// Logical node index.
    pub fid: u32,
    /// Source address of the UDP data sent by this member.
    pub address: IpAddr,
    /// Control plane host name of this member.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Inputs digitized by this member.
    pub inputs: [Input; 2],
}

/// Correlator input JSON schema.
///
/// Missing fields denote an unpopulated input.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct Input {
    /// Antenna number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub antenna: Option<u8>,
    /// Frequency chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<u8>,
    /// Polarization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polarization: Option<u8>,
}

/// Packet format profiles.
///
/// Both profiles share the fragment header format and differ in payload size
/// and number of fragments per node accumulation.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum PacketProfile {
    /// Legacy format.
    Legacy,
    /// Production format.
    #[default]
    Production,
}

macro_rules! impl_str_conv {
    ($ty:ty, $($s:expr => $v:ident),*) => {
        impl std::str::FromStr for $ty {
            type Err = ();

            fn from_str(s: &str) -> Result<Self, ()> {
                Ok(match s {
                    $(
                        $s => <$ty>::$v,
                    )*
                        _ => return Err(()),
                })
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
                write!(f, "{}", match self {
                    $(
                        <$ty>::$v => $s,
                    )*
                })
            }
        }
    }
}

impl_str_conv!(PacketProfile,
               "legacy" => Legacy,
               "production" => Production);

/// Walsh modulation JSON schema.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Walsh {
    /// Number of half-cycle positions in one demodulation period.
    pub period: u32,
    /// Ratio between the internal and external modulation step rates.
    pub skip: u32,
    /// Per-antenna modulation patterns.
    pub patterns: Vec<WalshPattern>,
}

impl Default for Walsh {
    fn default() -> Walsh {
        Walsh {
            period: 64,
            skip: 2,
            patterns: Vec::new(),
        }
    }
}

/// Walsh pattern of one antenna.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq, Hash)]
pub struct WalshPattern {
    /// Antenna number.
    pub antenna: u8,
    /// Cyclic string of phase symbols (hexadecimal digits).
    pub pattern: String,
}

/// API JSON schema.
///
/// This JSON schema corresponds to GET requests on `/api`. It contains a
/// summary of the configuration and the collector counters.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Api {
    /// Packet format in use.
    pub profile: PacketProfile,
    /// Payload size in bytes.
    pub payload_size: u32,
    /// Fragments per node accumulation.
    pub fragments: u32,
    /// Number of FIDs.
    pub fids: u32,
    /// Number of spectral channels.
    pub channels: u32,
    /// Number of words per channel in the packet order.
    pub packet_words: u32,
    /// Collector counters.
    pub counters: Counters,
}

/// Collector counters JSON schema.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Counters {
    /// Datagrams received.
    pub datagrams: u64,
    /// Datagrams discarded because of their size or header.
    pub malformed_datagrams: u64,
    /// Node buffers reassembled.
    pub node_buffers: u64,
    /// Node buffers discarded because their sender is unknown.
    pub unknown_senders: u64,
    /// Incomplete node buffers discarded by eviction.
    pub evicted_node_buffers: u64,
    /// Accumulations decoded.
    pub accumulations: u64,
    /// Incomplete accumulations discarded by eviction or shutdown.
    pub evicted_accumulations: u64,
    /// Words that could not be placed in the data package.
    pub decode_errors: u64,
    /// Observer failures.
    pub observer_errors: u64,
    /// Samples that did not match the ramp test pattern.
    pub ramp_errors: u64,
}

/// Sideband state table JSON schema.
///
/// This JSON schema corresponds to GET requests on `/api/sideband_states`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SidebandStates {
    /// Walsh step skip factor.
    pub skip: u32,
    /// One string of `0` and `1` per half-cycle position, with one character
    /// per X-engine word pair.
    pub states: Vec<String>,
}

/// Visibility JSON schema.
///
/// Each message of the `/visibilities` WebSocket contains one of these. It
/// holds the spectra of a baseline for one accumulation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Visibility {
    /// Accumulation sequence number.
    pub sequence: u32,
    /// Frequency chunk.
    pub chunk: u8,
    /// Left antenna.
    pub antenna_left: u8,
    /// Left polarization.
    pub polarization_left: u8,
    /// Right antenna.
    pub antenna_right: u8,
    /// Right polarization.
    pub polarization_right: u8,
    /// Lower sideband spectrum as `[re, im]` pairs.
    ///
    /// Channels for which no data was received are `null`.
    pub lsb: Vec<[Option<f64>; 2]>,
    /// Upper sideband spectrum as `[re, im]` pairs.
    pub usb: Vec<[Option<f64>; 2]>,
}
