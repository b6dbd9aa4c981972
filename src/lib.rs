//! swarm-collector receives the partial correlation products that the members
//! of a SWARM correlator quadrant stream over UDP. It reassembles the
//! fragments of each node accumulation, waits until every member has reported,
//! and decodes the accumulation into baseline and sideband spectra following
//! the correlation order of the X-engine. The decoded visibilities are handed
//! to observers and streamed to clients using WebSockets.

#![warn(missing_docs)]

pub mod aggregator;
pub mod app;
pub mod args;
pub mod config;
pub mod control;
pub mod decoder;
pub mod httpd;
pub mod input;
pub mod observer;
pub mod order;
pub mod package;
pub mod reassembly;
pub mod receiver;
pub mod stats;
pub mod walsh;
