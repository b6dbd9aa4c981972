//! Data package.
//!
//! A [`DataPackage`] contains the decoded data of one accumulation: a complex
//! spectrum for each baseline and sideband. Only one of the two conjugate
//! forms of each baseline is stored. Lookups using the other form return the
//! conjugated spectrum.

use crate::input::{Baseline, Sideband};
use anyhow::Result;
use chrono::{DateTime, Utc};
use num_complex::Complex;
use std::borrow::Cow;
use std::collections::HashMap;
use std::time::Duration;

/// Complex sample type used in the spectra.
pub type Sample = Complex<f64>;

/// Value used for the samples for which no data has been received.
pub const NO_DATA: Sample = Complex::new(f64::NAN, f64::NAN);

/// Decoded accumulation.
#[derive(Debug, Clone)]
pub struct DataPackage {
    sequence: u32,
    received: DateTime<Utc>,
    integration_time: Option<Duration>,
    channels: usize,
    baselines: Vec<Baseline>,
    index: HashMap<Baseline, usize>,
    // indexed by baseline index and Sideband::index
    spectra: Vec<[Vec<Sample>; 2]>,
}

/// Location of a baseline in a [`DataPackage`].
///
/// Obtained with [`DataPackage::locate`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Slot {
    index: usize,
    conjugate: bool,
    auto: bool,
}

/// Real or imaginary part of a sample.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Part {
    /// Real part.
    Real,
    /// Imaginary part.
    Imaginary,
}

impl DataPackage {
    /// Creates a new data package.
    ///
    /// The package contains the given `baselines`, each with two spectra of
    /// `channels` samples filled with [`NO_DATA`]. Repeated baselines are
    /// ignored.
    pub fn new(
        sequence: u32,
        baselines: impl IntoIterator<Item = Baseline>,
        channels: usize,
    ) -> DataPackage {
        let mut index = HashMap::new();
        let mut unique = Vec::new();
        for baseline in baselines {
            if let std::collections::hash_map::Entry::Vacant(e) = index.entry(baseline) {
                e.insert(unique.len());
                unique.push(baseline);
            }
        }
        let spectra = unique
            .iter()
            .map(|_| [vec![NO_DATA; channels], vec![NO_DATA; channels]])
            .collect();
        DataPackage {
            sequence,
            received: Utc::now(),
            integration_time: None,
            channels,
            baselines: unique,
            index,
            spectra,
        }
    }

    /// Returns the accumulation sequence number.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Returns the time at which the package was created.
    pub fn received(&self) -> DateTime<Utc> {
        self.received
    }

    /// Returns the time elapsed between this accumulation and the previous
    /// one, if known.
    pub fn integration_time(&self) -> Option<Duration> {
        self.integration_time
    }

    /// Sets the integration time.
    pub fn set_integration_time(&mut self, integration_time: Option<Duration>) {
        self.integration_time = integration_time;
    }

    /// Returns the number of channels of each spectrum.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Returns the baselines in the package, in their stored form.
    pub fn baselines(&self) -> &[Baseline] {
        &self.baselines
    }

    /// Finds where the data of a baseline is stored.
    ///
    /// If the baseline is not present but its conjugate is, the returned slot
    /// refers to the conjugate. Returns `None` if neither form is present.
    pub fn locate(&self, baseline: &Baseline) -> Option<Slot> {
        let auto = baseline.is_auto();
        if let Some(&index) = self.index.get(baseline) {
            return Some(Slot {
                index,
                conjugate: false,
                auto,
            });
        }
        self.index.get(&baseline.reversed()).map(|&index| Slot {
            index,
            conjugate: !auto,
            auto,
        })
    }

    /// Writes one part of a sample.
    ///
    /// Imaginary parts written through a conjugate slot are negated. Writing
    /// the real part of an auto-correlation also sets its imaginary part to
    /// zero, and writes to the imaginary part of an auto-correlation are
    /// ignored.
    ///
    /// # Panics
    ///
    /// Panics if `channel` is out of range.
    pub fn write(&mut self, slot: Slot, sideband: Sideband, channel: usize, part: Part, value: f64) {
        let sample = &mut self.spectra[slot.index][sideband.index()][channel];
        match part {
            Part::Real => {
                sample.re = value;
                if slot.auto {
                    sample.im = 0.0;
                }
            }
            Part::Imaginary if slot.auto => {}
            Part::Imaginary => sample.im = if slot.conjugate { -value } else { value },
        }
    }

    /// Stores a complex sample.
    ///
    /// The baseline may be given in any of its two forms. Fails if the
    /// baseline is not in the package or the channel is out of range.
    pub fn store(
        &mut self,
        baseline: &Baseline,
        sideband: Sideband,
        channel: usize,
        value: Sample,
    ) -> Result<()> {
        anyhow::ensure!(
            channel < self.channels,
            "channel {channel} out of range ({} channels)",
            self.channels
        );
        let slot = self
            .locate(baseline)
            .ok_or_else(|| anyhow::anyhow!("baseline {baseline} not in data package"))?;
        self.write(slot, sideband, channel, Part::Real, value.re);
        self.write(slot, sideband, channel, Part::Imaginary, value.im);
        Ok(())
    }

    /// Returns the spectrum of a baseline in a sideband.
    ///
    /// The baseline may be given in any of its two forms. The spectrum is
    /// conjugated when the baseline is given in the form that is not stored.
    pub fn get(&self, baseline: &Baseline, sideband: Sideband) -> Option<Cow<'_, [Sample]>> {
        let slot = self.locate(baseline)?;
        let spectrum = &self.spectra[slot.index][sideband.index()];
        Some(if slot.conjugate {
            Cow::Owned(spectrum.iter().map(|x| x.conj()).collect())
        } else {
            Cow::Borrowed(spectrum.as_slice())
        })
    }

    /// Returns `true` if any sample of the baseline has been written.
    pub fn has_data(&self, baseline: &Baseline) -> bool {
        self.locate(baseline).is_some_and(|slot| {
            self.spectra[slot.index]
                .iter()
                .flatten()
                .any(|x| !x.re.is_nan())
        })
    }
}
