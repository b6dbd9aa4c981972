//! Walsh demodulation sideband states.
//!
//! The inputs of the correlator are phase modulated with per-antenna Walsh
//! patterns. After demodulation, the sideband in which each X-engine word pair
//! ends up depends on the modulation state of the two antennas of the
//! baseline. The [`SidebandStateTable`] gives this for each half-cycle
//! position of the modulation period, and it is loaded into every node.

use crate::input::CorrelationWord;
use anyhow::Result;
use std::collections::HashMap;

/// Walsh patterns for a set of antennas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalshPatterns(HashMap<u8, Vec<u8>>);

/// Sideband state table.
///
/// One row per half-cycle position. Each row contains one bit per X-engine
/// word pair, packed into 32-bit words with the first pair in the LSB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidebandStateTable {
    pairs: usize,
    skip: usize,
    rows: Vec<Vec<u32>>,
}

impl WalshPatterns {
    /// Creates an empty set of patterns.
    pub fn new() -> WalshPatterns {
        WalshPatterns::default()
    }

    /// Sets the pattern of an antenna.
    ///
    /// The pattern is a string of hexadecimal digits, each of them a phase
    /// symbol. Fails if the pattern is empty or contains other characters.
    pub fn insert(&mut self, antenna: u8, pattern: &str) -> Result<()> {
        let symbols = pattern
            .chars()
            .map(|c| {
                c.to_digit(16)
                    .map(|d| d as u8)
                    .ok_or_else(|| {
                        anyhow::anyhow!("invalid Walsh symbol {c:?} for antenna {antenna}")
                    })
            })
            .collect::<Result<Vec<u8>>>()?;
        anyhow::ensure!(!symbols.is_empty(), "empty Walsh pattern for antenna {antenna}");
        self.0.insert(antenna, symbols);
        Ok(())
    }

    /// Returns the pattern symbols of an antenna.
    pub fn get(&self, antenna: u8) -> Option<&[u8]> {
        self.0.get(&antenna).map(|p| p.as_slice())
    }

    fn symbol(&self, antenna: u8, step: usize) -> Result<u8> {
        let pattern = self
            .get(antenna)
            .ok_or_else(|| anyhow::anyhow!("no Walsh pattern for antenna {antenna}"))?;
        Ok(pattern[step % pattern.len()])
    }
}

impl TryFrom<&[swarm_json::WalshPattern]> for WalshPatterns {
    type Error = anyhow::Error;

    fn try_from(patterns: &[swarm_json::WalshPattern]) -> Result<WalshPatterns> {
        let mut walsh = WalshPatterns::new();
        for p in patterns {
            walsh.insert(p.antenna, &p.pattern)?;
        }
        Ok(walsh)
    }
}

impl SidebandStateTable {
    /// Computes the sideband state table.
    ///
    /// `xeng` is the correlation order in X-engine order. `period` is the
    /// number of half-cycle positions in a demodulation period and `skip` is
    /// the number of Walsh steps per half-cycle position.
    ///
    /// For each word pair the first baseline of the pair is used. Auto and
    /// invalid baselines have a fixed state of 0. Otherwise the state is 1 if
    /// the least significant bits of the symbols of both antennas are equal.
    pub fn new(
        xeng: &[CorrelationWord],
        patterns: &WalshPatterns,
        period: usize,
        skip: usize,
    ) -> Result<SidebandStateTable> {
        anyhow::ensure!(period > 0, "Walsh period must be positive");
        anyhow::ensure!(skip > 0, "Walsh skip must be positive");
        let pairs = xeng.len().div_ceil(2);
        let rows = (0..period)
            .map(|position| -> Result<Vec<u32>> {
                let step = position * skip;
                let mut row = vec![0u32; pairs.div_ceil(32)];
                for (n, pair) in xeng.chunks(2).enumerate() {
                    let baseline = pair[0].baseline;
                    if baseline.is_auto() || !baseline.is_valid() {
                        continue;
                    }
                    // valid baselines always have both antennas
                    let (Some(left), Some(right)) =
                        (baseline.left.antenna(), baseline.right.antenna())
                    else {
                        continue;
                    };
                    let left = patterns.symbol(left, step)?;
                    let right = patterns.symbol(right, step)?;
                    if (left ^ right) & 1 == 0 {
                        row[n / 32] |= 1 << (n % 32);
                    }
                }
                Ok(row)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(SidebandStateTable { pairs, skip, rows })
    }

    /// Returns the number of half-cycle positions.
    pub fn period(&self) -> usize {
        self.rows.len()
    }

    /// Returns the number of word pairs in each row.
    pub fn pairs(&self) -> usize {
        self.pairs
    }

    /// Returns the state of a word pair at a half-cycle position.
    ///
    /// # Panics
    ///
    /// Panics if `position` or `pair` are out of range.
    pub fn state(&self, position: usize, pair: usize) -> bool {
        assert!(pair < self.pairs);
        (self.rows[position][pair / 32] >> (pair % 32)) & 1 == 1
    }

    /// Serializes the table as big-endian 32-bit words, row after row.
    ///
    /// This is the format in which the table is loaded into the nodes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.rows
            .iter()
            .flatten()
            .flat_map(|w| w.to_be_bytes())
            .collect()
    }

    /// Returns the table in the JSON format used by the API.
    pub fn to_json(&self) -> swarm_json::SidebandStates {
        swarm_json::SidebandStates {
            skip: self.skip as u32,
            states: (0..self.period())
                .map(|position| {
                    (0..self.pairs)
                        .map(|pair| if self.state(position, pair) { '1' } else { '0' })
                        .collect()
                })
                .collect(),
        }
    }
}
