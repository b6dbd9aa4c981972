//! Accumulation decoder.
//!
//! The decoder turns the node buffers of an accumulation into a
//! [`DataPackage`]. Each node buffer is an array of big-endian `i32` samples.
//! The channel of each sample is given by a static striding pattern, and the
//! meaning of the sample within the channel is given by the packet order.

use crate::input::{Baseline, CorrelationWord, SignalInput};
use crate::order::CorrelationOrder;
use crate::package::{DataPackage, Part};
use anyhow::Result;
use bytes::Bytes;
use std::collections::BTreeSet;

/// Spectral geometry of the correlator.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SpectralGeometry {
    /// Number of channels per chunk and sideband.
    pub channels: usize,
    /// Number of nodes.
    pub fids: usize,
    /// Number of channels processed in parallel by the X-engine.
    pub parallel_channels: usize,
}

/// Static assignment of samples to channels.
///
/// Channels are distributed among the nodes in blocks of
/// `parallel_channels` consecutive channels. Within a node buffer, the samples
/// of each block are interleaved: for each word of the packet order there is
/// one sample per channel of the block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    parallel_channels: usize,
    // for each node, the channels in the order in which their blocks appear
    node_channels: Vec<Vec<usize>>,
}

/// Accumulation decoder.
#[derive(Debug, Clone)]
pub struct Decoder {
    geometry: SpectralGeometry,
    words: Vec<CorrelationWord>,
    baselines: Vec<Baseline>,
    channel_map: ChannelMap,
}

/// Result of decoding an accumulation.
#[derive(Debug)]
pub struct Decoded {
    /// Decoded data.
    pub package: DataPackage,
    /// Number of words that could not be placed in the package.
    pub errors: usize,
}

impl SpectralGeometry {
    /// Returns the number of channels handled by each node.
    pub fn channels_per_node(&self) -> usize {
        self.channels / self.fids
    }

    /// Checks that the channels can be evenly distributed among the nodes.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.fids > 0, "no FIDs configured");
        anyhow::ensure!(self.parallel_channels > 0, "parallel channels must be positive");
        anyhow::ensure!(
            self.channels % (self.fids * self.parallel_channels) == 0,
            "{} channels cannot be split among {} FIDs in blocks of {} channels",
            self.channels,
            self.fids,
            self.parallel_channels
        );
        Ok(())
    }
}

impl ChannelMap {
    /// Computes the channel map for a geometry.
    pub fn new(geometry: &SpectralGeometry) -> ChannelMap {
        let par = geometry.parallel_channels;
        let groups = geometry.channels_per_node() / par;
        let node_channels = (0..geometry.fids)
            .map(|fid| {
                (0..groups)
                    .flat_map(|group| {
                        let base = (group * geometry.fids + fid) * par;
                        base..base + par
                    })
                    .collect()
            })
            .collect();
        ChannelMap {
            parallel_channels: par,
            node_channels,
        }
    }

    /// Returns the channel of a sample.
    ///
    /// `k` is the index of the sample within the buffer of node `fid`, and
    /// `words` is the number of words per channel.
    pub fn channel(&self, fid: usize, k: usize, words: usize) -> usize {
        let par = self.parallel_channels;
        let group = k / (par * words);
        let lane = k % par;
        self.node_channels[fid][group * par + lane]
    }

    /// Returns the channels of a node in block order.
    pub fn node_channels(&self, fid: usize) -> &[usize] {
        &self.node_channels[fid]
    }
}

impl Decoder {
    /// Creates a decoder.
    ///
    /// The data packages produced by the decoder contain one entry per
    /// canonical baseline of the `inputs`: each pair of valid inputs of the
    /// same chunk, sorted so that the left input is not greater than the right
    /// one.
    pub fn new(
        geometry: SpectralGeometry,
        order: &CorrelationOrder,
        inputs: &[SignalInput],
    ) -> Result<Decoder> {
        geometry.validate()?;
        Ok(Decoder {
            geometry,
            words: order.packet().to_vec(),
            baselines: canonical_baselines(inputs),
            channel_map: ChannelMap::new(&geometry),
        })
    }

    /// Returns the spectral geometry.
    pub fn geometry(&self) -> SpectralGeometry {
        self.geometry
    }

    /// Returns the number of words per channel.
    pub fn words(&self) -> usize {
        self.words.len()
    }

    /// Returns the baselines of the data packages.
    pub fn baselines(&self) -> &[Baseline] {
        &self.baselines
    }

    /// Returns the number of `i32` samples in each node buffer.
    pub fn samples_per_node(&self) -> usize {
        self.geometry.channels_per_node() * self.words.len()
    }

    /// Returns the size in bytes of each node buffer.
    pub fn node_buffer_size(&self) -> usize {
        self.samples_per_node() * std::mem::size_of::<i32>()
    }

    /// Returns the channel map.
    pub fn channel_map(&self) -> &ChannelMap {
        &self.channel_map
    }

    /// Decodes an accumulation.
    ///
    /// `buffers` contains the node buffers indexed by FID. Buffers of the wrong
    /// size are skipped. Words that cannot be placed in the package, even
    /// after trying the conjugate baseline, are dropped and counted as errors.
    #[tracing::instrument(name = "decode", level = "debug", skip(self, buffers))]
    pub fn decode(&self, sequence: u32, buffers: &[Bytes]) -> Decoded {
        let mut package = DataPackage::new(
            sequence,
            self.baselines.iter().copied(),
            self.geometry.channels,
        );
        let mut errors = 0;

        // Resolve each word once per accumulation.
        let mut targets = Vec::with_capacity(self.words.len());
        for (n, word) in self.words.iter().enumerate() {
            if !word.baseline.is_valid() {
                targets.push(None);
                continue;
            }
            let target = package.locate(&word.baseline).zip(word.sideband);
            if target.is_none() {
                tracing::error!(
                    sequence,
                    word = n,
                    baseline = %word.baseline,
                    "baseline not found in data package"
                );
                errors += 1;
            }
            let part = if word.imaginary {
                Part::Imaginary
            } else {
                Part::Real
            };
            targets.push(target.map(|(slot, sideband)| (slot, sideband, part)));
        }

        let words = self.words.len();
        let par = self.geometry.parallel_channels;
        for (fid, buffer) in buffers.iter().enumerate() {
            if fid >= self.geometry.fids {
                tracing::error!(sequence, fid, "unexpected node buffer");
                continue;
            }
            if buffer.len() != self.node_buffer_size() {
                tracing::error!(
                    sequence,
                    fid,
                    size = buffer.len(),
                    expected = self.node_buffer_size(),
                    "node buffer has wrong size"
                );
                continue;
            }
            let samples = buffer
                .chunks_exact(4)
                .map(|x| i32::from_be_bytes([x[0], x[1], x[2], x[3]]));
            for (k, sample) in samples.enumerate() {
                let word = (k / par) % words;
                let Some((slot, sideband, part)) = targets[word] else {
                    continue;
                };
                let channel = self.channel_map.channel(fid, k, words);
                package.write(slot, sideband, channel, part, f64::from(sample));
            }
        }

        Decoded { package, errors }
    }
}

/// Returns the canonical baselines of a set of inputs.
///
/// These are all the pairs `(a, b)` of valid inputs of the same chunk with
/// `a <= b`, including the auto-correlations.
pub fn canonical_baselines(inputs: &[SignalInput]) -> Vec<Baseline> {
    let inputs: BTreeSet<SignalInput> = inputs.iter().copied().filter(|i| i.is_valid()).collect();
    inputs
        .iter()
        .flat_map(|&a| {
            inputs
                .range(a..)
                .map(move |&b| Baseline::new(a, b))
                .filter(|b| b.is_valid())
        })
        .collect()
}
