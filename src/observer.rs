//! Accumulation observers.
//!
//! Observers are the consumers of the accumulations. Raw observers receive
//! the undecoded node buffers of each accumulation, and data observers
//! receive the decoded [`DataPackage`]. The [`Observers`] dispatcher runs them
//! in registration order, raw observers first, and isolates their failures:
//! an observer that returns an error or panics is logged and counted, but the
//! remaining observers still run.

use crate::input::Sideband;
use crate::package::{DataPackage, Sample};
use crate::stats::Counters;
use anyhow::Result;
use bytes::Bytes;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Observer of undecoded accumulations.
pub trait RawObserver: Send {
    /// Returns the name of the observer.
    ///
    /// The name is used when logging errors.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Observes the node buffers of an accumulation.
    ///
    /// The buffers are given in FID order.
    fn observe(&mut self, sequence: u32, buffers: &[Bytes]) -> Result<()>;
}

/// Observer of decoded accumulations.
pub trait DataObserver: Send {
    /// Returns the name of the observer.
    ///
    /// The name is used when logging errors.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Observes a decoded accumulation.
    fn observe(&mut self, package: &DataPackage) -> Result<()>;
}

impl<F> DataObserver for F
where
    F: FnMut(&DataPackage) -> Result<()> + Send,
{
    fn observe(&mut self, package: &DataPackage) -> Result<()> {
        self(package)
    }
}

/// Observer dispatcher.
pub struct Observers {
    raw: Vec<Box<dyn RawObserver>>,
    data: Vec<Box<dyn DataObserver>>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("raw", &self.raw.iter().map(|o| o.name()).collect::<Vec<_>>())
            .field("data", &self.data.iter().map(|o| o.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl Observers {
    /// Creates an empty dispatcher.
    ///
    /// Observer failures are counted in `counters`.
    pub fn new(counters: Arc<Counters>) -> Observers {
        Observers {
            raw: Vec::new(),
            data: Vec::new(),
            counters,
        }
    }

    /// Registers a raw observer.
    pub fn add_raw(&mut self, observer: impl RawObserver + 'static) {
        self.raw.push(Box::new(observer));
    }

    /// Registers a data observer.
    pub fn add_data(&mut self, observer: impl DataObserver + 'static) {
        self.data.push(Box::new(observer));
    }

    /// Returns `true` if there are no observers registered.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty() && self.data.is_empty()
    }

    /// Hands an accumulation to all the observers.
    ///
    /// The raw observers receive `buffers` and then the data observers receive
    /// `package`.
    pub fn dispatch(&mut self, buffers: &[Bytes], package: &DataPackage) {
        let sequence = package.sequence();
        for observer in self.raw.iter_mut() {
            let ret = std::panic::catch_unwind(AssertUnwindSafe(|| {
                observer.observe(sequence, buffers)
            }));
            report(&self.counters, observer.name(), sequence, ret);
        }
        for observer in self.data.iter_mut() {
            let ret = std::panic::catch_unwind(AssertUnwindSafe(|| observer.observe(package)));
            report(&self.counters, observer.name(), sequence, ret);
        }
    }
}

fn report(
    counters: &Counters,
    name: &str,
    sequence: u32,
    ret: std::thread::Result<Result<()>>,
) {
    match ret {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::error!(observer = name, sequence, "observer failed: {err:#}");
            counters.observer_errors(1);
        }
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            tracing::error!(observer = name, sequence, "observer panicked: {msg}");
            counters.observer_errors(1);
        }
    }
}

/// Test ramp checker.
///
/// When the nodes are in test mode they replace the correlation products by
/// a ramp: each sample holds the index of its word within the channel block.
/// This raw observer checks that the node buffers contain the ramp and counts
/// the mismatching samples.
#[derive(Debug, Clone)]
pub struct RampChecker {
    parallel_channels: usize,
    words: usize,
    counters: Arc<Counters>,
}

impl RampChecker {
    /// Creates a ramp checker.
    ///
    /// `words` is the number of words per channel in packet order.
    pub fn new(parallel_channels: usize, words: usize, counters: Arc<Counters>) -> RampChecker {
        RampChecker {
            parallel_channels,
            words,
            counters,
        }
    }

    /// Returns the number of samples in `buffer` that do not follow the ramp.
    pub fn check(&self, buffer: &[u8]) -> usize {
        buffer
            .chunks_exact(4)
            .map(|x| i32::from_be_bytes([x[0], x[1], x[2], x[3]]))
            .enumerate()
            .filter(|&(k, sample)| {
                let expected = (k / self.parallel_channels) % self.words;
                i64::from(sample) != expected as i64
            })
            .count()
    }
}

impl RawObserver for RampChecker {
    fn name(&self) -> &str {
        "ramp_checker"
    }

    fn observe(&mut self, sequence: u32, buffers: &[Bytes]) -> Result<()> {
        let mut total = 0;
        for (fid, buffer) in buffers.iter().enumerate() {
            let errors = self.check(buffer);
            if errors > 0 {
                tracing::warn!(sequence, fid, errors, "ramp mismatch");
            }
            total += errors;
        }
        self.counters.ramp_errors(total as u64);
        anyhow::ensure!(total == 0, "{total} samples do not follow the test ramp");
        Ok(())
    }
}

/// Visibilities of one baseline in one accumulation.
///
/// This is what a [`Sink`] receives.
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a> {
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
    /// Lower sideband spectrum.
    pub lsb: &'a [Sample],
    /// Upper sideband spectrum.
    pub usb: &'a [Sample],
}

/// Downstream visibility sink.
pub trait Sink: Send {
    /// Delivers the visibilities of a baseline.
    fn deliver(&mut self, delivery: Delivery<'_>) -> Result<()>;
}

/// Data observer that hands each baseline of a package to a [`Sink`].
#[derive(Debug)]
pub struct SinkObserver<S> {
    sink: S,
}

impl<S: Sink> SinkObserver<S> {
    /// Creates a sink observer.
    pub fn new(sink: S) -> SinkObserver<S> {
        SinkObserver { sink }
    }

    /// Returns a reference to the sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }
}

impl<S: Sink> DataObserver for SinkObserver<S> {
    fn name(&self) -> &str {
        "sink"
    }

    fn observe(&mut self, package: &DataPackage) -> Result<()> {
        let mut failed = 0;
        let mut first_error = None;
        for baseline in package.baselines() {
            if !baseline.is_valid() {
                continue;
            }
            let left = &baseline.left;
            let right = &baseline.right;
            let (Some(chunk), Some(antenna_left), Some(polarization_left)) =
                (baseline.chunk(), left.antenna(), left.polarization())
            else {
                continue;
            };
            let (Some(antenna_right), Some(polarization_right)) =
                (right.antenna(), right.polarization())
            else {
                continue;
            };
            let (Some(lsb), Some(usb)) = (
                package.get(baseline, Sideband::Lower),
                package.get(baseline, Sideband::Upper),
            ) else {
                continue;
            };
            let delivery = Delivery {
                sequence: package.sequence(),
                chunk,
                antenna_left,
                polarization_left,
                antenna_right,
                polarization_right,
                lsb: &lsb,
                usb: &usb,
            };
            if let Err(err) = self.sink.deliver(delivery) {
                failed += 1;
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err.context(format!("sink failed for {failed} baselines"))),
            None => Ok(()),
        }
    }
}

/// Sink that sends visibilities as JSON to a broadcast channel.
///
/// Each delivery is serialized as a [`swarm_json::Visibility`]. Deliveries are
/// only serialized when the channel has receivers.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<Bytes>,
}

impl BroadcastSink {
    /// Creates a broadcast sink sending to `sender`.
    pub fn new(sender: broadcast::Sender<Bytes>) -> BroadcastSink {
        BroadcastSink { sender }
    }
}

impl Sink for BroadcastSink {
    fn deliver(&mut self, delivery: Delivery<'_>) -> Result<()> {
        if self.sender.receiver_count() == 0 {
            return Ok(());
        }
        let finite = |x: f64| if x.is_nan() { None } else { Some(x) };
        let to_json = |s: &[Sample]| s.iter().map(|x| [finite(x.re), finite(x.im)]).collect();
        let visibility = swarm_json::Visibility {
            sequence: delivery.sequence,
            chunk: delivery.chunk,
            antenna_left: delivery.antenna_left,
            polarization_left: delivery.polarization_left,
            antenna_right: delivery.antenna_right,
            polarization_right: delivery.polarization_right,
            lsb: to_json(delivery.lsb),
            usb: to_json(delivery.usb),
        };
        // It is ok if send returns Err, because all the receivers might have
        // gone away since we checked.
        let _ = self.sender.send(Bytes::from(serde_json::to_vec(&visibility)?));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::input::{Baseline, SignalInput};
    use num_complex::Complex;
    use std::sync::Mutex;

    fn package() -> DataPackage {
        let a = SignalInput::new(0, 0, 0);
        let b = SignalInput::new(1, 0, 1);
        let mut package = DataPackage::new(
            7,
            [Baseline::new(a, a), Baseline::new(a, b), Baseline::new(b, b)],
            2,
        );
        package
            .store(&Baseline::new(a, b), Sideband::Upper, 1, Complex::new(1.0, 2.0))
            .unwrap();
        package
    }

    #[derive(Default, Clone)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Recorder {
        fn push(&self, s: String) {
            self.0.lock().unwrap().push(s);
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut self.0.lock().unwrap())
        }
    }

    struct Named(&'static str, Recorder);

    impl RawObserver for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn observe(&mut self, sequence: u32, buffers: &[Bytes]) -> Result<()> {
            self.1.push(format!("{} {sequence} {}", self.0, buffers.len()));
            Ok(())
        }
    }

    #[test]
    fn dispatch_order() {
        let counters = Arc::new(Counters::default());
        let recorder = Recorder::default();
        let mut observers = Observers::new(Arc::clone(&counters));
        let r = recorder.clone();
        observers.add_data(move |p: &DataPackage| -> Result<()> {
            r.push(format!("data {}", p.sequence()));
            Ok(())
        });
        observers.add_raw(Named("first", recorder.clone()));
        observers.add_raw(Named("second", recorder.clone()));
        observers.dispatch(&[Bytes::new(), Bytes::new()], &package());
        assert_eq!(recorder.take(), ["first 7 2", "second 7 2", "data 7"]);
        assert_eq!(counters.snapshot().observer_errors, 0);
    }

    #[test]
    fn failures_are_isolated() {
        let counters = Arc::new(Counters::default());
        let recorder = Recorder::default();
        let mut observers = Observers::new(Arc::clone(&counters));
        observers.add_data(|_: &DataPackage| -> Result<()> { anyhow::bail!("broken") });
        observers.add_data(|_: &DataPackage| -> Result<()> { panic!("very broken") });
        let r = recorder.clone();
        observers.add_data(move |p: &DataPackage| -> Result<()> {
            r.push(format!("ok {}", p.sequence()));
            Ok(())
        });
        let package = package();
        observers.dispatch(&[], &package);
        observers.dispatch(&[], &package);
        assert_eq!(recorder.take(), ["ok 7", "ok 7"]);
        assert_eq!(counters.snapshot().observer_errors, 4);
    }

    #[test]
    fn ramp_checker() {
        let counters = Arc::new(Counters::default());
        let mut checker = RampChecker::new(2, 3, Arc::clone(&counters));
        // 2 parallel channels, 3 words, 2 blocks
        let ramp: Vec<i32> = vec![0, 0, 1, 1, 2, 2, 0, 0, 1, 1, 2, 2];
        let good: Bytes = ramp.iter().flat_map(|x| x.to_be_bytes()).collect();
        assert_eq!(checker.check(&good), 0);
        checker.observe(0, &[good.clone(), good.clone()]).unwrap();
        let mut bad = ramp.clone();
        bad[3] = 5;
        bad[11] = 0;
        let bad: Bytes = bad.iter().flat_map(|x| x.to_be_bytes()).collect();
        assert_eq!(checker.check(&bad), 2);
        assert!(checker.observe(1, &[good, bad]).is_err());
        assert_eq!(counters.snapshot().ramp_errors, 2);
    }

    #[derive(Default)]
    struct CollectSink(Vec<(u8, u8, u8, u8, u8, Vec<Sample>)>, usize);

    impl Sink for CollectSink {
        fn deliver(&mut self, d: Delivery<'_>) -> Result<()> {
            assert_eq!(d.sequence, 7);
            assert_eq!(d.lsb.len(), 2);
            self.0.push((
                d.chunk,
                d.antenna_left,
                d.polarization_left,
                d.antenna_right,
                d.polarization_right,
                d.usb.to_vec(),
            ));
            self.1 += 1;
            if self.1 == 2 {
                anyhow::bail!("full");
            }
            Ok(())
        }
    }

    #[test]
    fn sink_observer() {
        let mut observer = SinkObserver::new(CollectSink::default());
        // the second delivery fails, but the third baseline is delivered anyway
        assert!(observer.observe(&package()).is_err());
        let delivered = &observer.sink().0;
        assert_eq!(delivered.len(), 3);
        let (chunk, al, pl, ar, pr, usb) = &delivered[1];
        assert_eq!((*chunk, *al, *pl, *ar, *pr), (0, 0, 0, 1, 1));
        assert_eq!(usb[1], Complex::new(1.0, 2.0));
        assert!(usb[0].re.is_nan());
    }

    #[test]
    fn broadcast_sink() {
        let (sender, mut receiver) = broadcast::channel(16);
        let mut observer = SinkObserver::new(BroadcastSink::new(sender));
        observer.observe(&package()).unwrap();
        let mut visibilities = Vec::new();
        while let Ok(msg) = receiver.try_recv() {
            visibilities.push(serde_json::from_slice::<swarm_json::Visibility>(&msg).unwrap());
        }
        assert_eq!(visibilities.len(), 3);
        let cross = &visibilities[1];
        assert_eq!(cross.sequence, 7);
        assert_eq!((cross.antenna_left, cross.antenna_right), (0, 1));
        assert_eq!(cross.usb[1], [Some(1.0), Some(2.0)]);
        assert_eq!(cross.usb[0], [None, None]);
    }
}
