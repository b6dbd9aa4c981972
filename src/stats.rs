//! Collector counters.
//!
//! The counters are shared between the receiver, the aggregator and the HTTP
//! server. They are updated with relaxed atomic operations.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! impl_counters {
    ($($counter:ident),*) => {
        /// Collector counters.
        ///
        /// There is one counter for each field of [`swarm_json::Counters`].
        #[derive(Debug, Default)]
        pub struct Counters {
            $(
                $counter: AtomicU64,
            )*
        }

        impl Counters {
            $(
                #[doc = concat!("Increments the ", stringify!($counter), " counter.")]
                pub fn $counter(&self, n: u64) {
                    self.$counter.fetch_add(n, Ordering::Relaxed);
                }
            )*

            /// Returns the current value of the counters.
            pub fn snapshot(&self) -> swarm_json::Counters {
                swarm_json::Counters {
                    $(
                        $counter: self.$counter.load(Ordering::Relaxed),
                    )*
                }
            }
        }
    }
}

impl_counters!(
    datagrams,
    malformed_datagrams,
    node_buffers,
    unknown_senders,
    evicted_node_buffers,
    accumulations,
    evicted_accumulations,
    decode_errors,
    observer_errors,
    ramp_errors
);
