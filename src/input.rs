//! Correlator inputs and baselines.
//!
//! This module contains the value types that label the data produced by the
//! correlator: a [`SignalInput`] is one physical signal path, a [`Baseline`]
//! is a pair of them, and a [`CorrelationWord`] is one real or imaginary
//! output word of the X-engine for a baseline.

use std::fmt;

/// Correlator input.
///
/// An input is identified by its antenna, frequency chunk and polarization.
/// Inputs with any of these missing correspond to unpopulated hardware slots
/// and are invalid.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct SignalInput {
    antenna: Option<u8>,
    chunk: Option<u8>,
    polarization: Option<u8>,
}

/// Baseline.
///
/// A baseline is an ordered pair of inputs. The baseline `(b, a)` is the
/// complex conjugate of the baseline `(a, b)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Baseline {
    /// Left input.
    pub left: SignalInput,
    /// Right input (conjugated in the product).
    pub right: SignalInput,
}

/// Sideband.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Sideband {
    /// Lower sideband.
    Lower,
    /// Upper sideband.
    Upper,
}

/// Correlation word.
///
/// This is the atomic unit transmitted by the hardware for each channel: the
/// real or imaginary part of one baseline. Words in X-engine order have no
/// sideband; words in packet order carry the sideband in which they are
/// transmitted.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct CorrelationWord {
    /// Baseline of the word.
    pub baseline: Baseline,
    /// Whether the word is the imaginary part.
    pub imaginary: bool,
    /// Sideband of the word.
    pub sideband: Option<Sideband>,
}

impl SignalInput {
    /// Creates a valid input.
    pub fn new(antenna: u8, chunk: u8, polarization: u8) -> SignalInput {
        SignalInput {
            antenna: Some(antenna),
            chunk: Some(chunk),
            polarization: Some(polarization),
        }
    }

    /// Creates an input from optional fields.
    ///
    /// The input is invalid unless all the fields are present.
    pub fn from_parts(
        antenna: Option<u8>,
        chunk: Option<u8>,
        polarization: Option<u8>,
    ) -> SignalInput {
        SignalInput {
            antenna,
            chunk,
            polarization,
        }
    }

    /// Returns the antenna number.
    pub fn antenna(&self) -> Option<u8> {
        self.antenna
    }

    /// Returns the frequency chunk.
    pub fn chunk(&self) -> Option<u8> {
        self.chunk
    }

    /// Returns the polarization.
    pub fn polarization(&self) -> Option<u8> {
        self.polarization
    }

    /// Returns `true` if all the fields of the input are present.
    pub fn is_valid(&self) -> bool {
        self.antenna.is_some() && self.chunk.is_some() && self.polarization.is_some()
    }
}

impl From<swarm_json::Input> for SignalInput {
    fn from(input: swarm_json::Input) -> SignalInput {
        SignalInput::from_parts(input.antenna, input.chunk, input.polarization)
    }
}

impl fmt::Display for SignalInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        fn field(x: Option<u8>) -> String {
            x.map_or_else(|| "?".to_string(), |x| x.to_string())
        }
        write!(
            f,
            "ant{}:chk{}:pol{}",
            field(self.antenna),
            field(self.chunk),
            field(self.polarization)
        )
    }
}

impl Baseline {
    /// Creates a new baseline.
    pub fn new(left: SignalInput, right: SignalInput) -> Baseline {
        Baseline { left, right }
    }

    /// Returns `true` for the correlation of an input with itself.
    pub fn is_auto(&self) -> bool {
        self.left == self.right
    }

    /// Returns `true` if both inputs are valid and belong to the same chunk.
    pub fn is_valid(&self) -> bool {
        self.left.is_valid() && self.right.is_valid() && self.left.chunk == self.right.chunk
    }

    /// Returns the conjugate baseline.
    pub fn reversed(&self) -> Baseline {
        Baseline {
            left: self.right,
            right: self.left,
        }
    }

    /// Returns the chunk of the baseline.
    ///
    /// This is `None` unless the baseline is valid.
    pub fn chunk(&self) -> Option<u8> {
        if self.is_valid() {
            self.left.chunk
        } else {
            None
        }
    }
}

impl fmt::Display for Baseline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{}x{}", self.left, self.right)
    }
}

impl Sideband {
    /// Both sidebands, in the order used to index the data package.
    pub const ALL: [Sideband; 2] = [Sideband::Lower, Sideband::Upper];

    /// Returns the index of the sideband in [`Sideband::ALL`].
    pub fn index(self) -> usize {
        match self {
            Sideband::Lower => 0,
            Sideband::Upper => 1,
        }
    }
}

impl fmt::Display for Sideband {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(
            f,
            "{}",
            match self {
                Sideband::Lower => "LSB",
                Sideband::Upper => "USB",
            }
        )
    }
}

impl CorrelationWord {
    /// Creates an X-engine word, which has no sideband.
    pub fn new(baseline: Baseline, imaginary: bool) -> CorrelationWord {
        CorrelationWord {
            baseline,
            imaginary,
            sideband: None,
        }
    }

    /// Returns a copy of the word in the given sideband.
    pub fn with_sideband(self, sideband: Sideband) -> CorrelationWord {
        CorrelationWord {
            sideband: Some(sideband),
            ..self
        }
    }
}
