//! Correlation order.
//!
//! The X-engine computes the baselines of all the input slots following a
//! systolic "butterfly" schedule. The words that it emits for each channel
//! appear in the order given by that schedule. This module computes that
//! order analytically, so that the decoder and the firmware agree on the
//! meaning of each word.

use crate::input::{Baseline, CorrelationWord, SignalInput, Sideband};
use anyhow::Result;

/// Input slot.
///
/// Each correlator member digitizes two inputs. These are processed together
/// by the X-engine and are referred to as sub-channels 0 and 1 of the slot.
pub type InputSlot = [SignalInput; 2];

/// Correlation order.
///
/// Holds the X-engine order and the packet order for a list of input slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationOrder {
    xeng: Vec<CorrelationWord>,
    packet: Vec<CorrelationWord>,
}

impl CorrelationOrder {
    /// Computes the correlation order for a list of input slots.
    ///
    /// The number of slots must be a power of two and at least 2.
    pub fn new(slots: &[InputSlot]) -> Result<CorrelationOrder> {
        let xeng = xeng_order(slots)?;
        let packet = packet_order(&xeng);
        Ok(CorrelationOrder { xeng, packet })
    }

    /// Returns the words in X-engine order.
    pub fn xeng(&self) -> &[CorrelationWord] {
        &self.xeng
    }

    /// Returns the words in the order in which they are transmitted.
    pub fn packet(&self) -> &[CorrelationWord] {
        &self.packet
    }

    /// Returns the baselines that appear in the order, without repetition.
    ///
    /// The baselines are returned in order of first appearance.
    pub fn baselines(&self) -> Vec<Baseline> {
        let mut seen = std::collections::HashSet::new();
        self.xeng
            .iter()
            .map(|w| w.baseline)
            .filter(|b| seen.insert(*b))
            .collect()
    }
}

/// Returns the expected number of X-engine words for `n` input slots.
pub fn xeng_words(n: usize) -> usize {
    4 * n + 8 * (n * n.saturating_sub(1) / 2)
}

/// Computes the X-engine order.
///
/// The schedule runs for `n + n/2 - 1` clocks. At clock `c` the home slot is
/// `c % n`. During the first `n` clocks the home slot is the right-hand side
/// of the pairs, and it is paired with the slots up to `min(c, n/2)` positions
/// behind it. In the remaining clocks the home slot is the left-hand side and
/// it is paired with the slots between `n/2 - 1` and `c % n + 1` positions
/// behind it.
pub fn xeng_order(slots: &[InputSlot]) -> Result<Vec<CorrelationWord>> {
    let n = slots.len();
    anyhow::ensure!(
        n >= 2 && n.is_power_of_two(),
        "number of input slots ({n}) is not a power of 2 greater or equal than 2"
    );
    let half = n / 2;
    let mut words = Vec::with_capacity(xeng_words(n));
    for clock in 0..n + half - 1 {
        let home = clock % n;
        if clock < n {
            for stage in (0..=clock.min(half)).rev() {
                let left = (home + n - stage) % n;
                emit_pair(&mut words, slots, left, home);
            }
        } else {
            for stage in (home + 1..half).rev() {
                let right = (home + n - stage) % n;
                emit_pair(&mut words, slots, home, right);
            }
        }
    }
    Ok(words)
}

// Auto-correlation is decided by slot position, not by the value of the
// inputs: two slots wired to identical inputs still produce cross words.
fn emit_pair(words: &mut Vec<CorrelationWord>, slots: &[InputSlot], left: usize, right: usize) {
    let [l0, l1] = slots[left];
    let [r0, r1] = slots[right];
    if left == right {
        words.extend([
            CorrelationWord::new(Baseline::new(l0, l0), false),
            CorrelationWord::new(Baseline::new(l1, l1), false),
            CorrelationWord::new(Baseline::new(l0, l1), false),
            CorrelationWord::new(Baseline::new(l0, l1), true),
        ]);
    } else {
        for baseline in [
            Baseline::new(l0, r0),
            Baseline::new(l1, r1),
            Baseline::new(l0, r1),
            Baseline::new(l1, r0),
        ] {
            words.push(CorrelationWord::new(baseline, false));
            words.push(CorrelationWord::new(baseline, true));
        }
    }
}

/// Computes the packet order from the X-engine order.
///
/// The firmware multiplexes two 32-bit lanes into a wider bus, so each pair of
/// consecutive X-engine words is transmitted twice: first in the lower
/// sideband and then in the upper sideband.
pub fn packet_order(xeng: &[CorrelationWord]) -> Vec<CorrelationWord> {
    xeng.chunks(2)
        .flat_map(|pair| {
            Sideband::ALL
                .into_iter()
                .flat_map(move |sb| pair.iter().map(move |w| w.with_sideband(sb)))
        })
        .collect()
}
