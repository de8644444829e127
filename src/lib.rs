//! Measure internal and external heap fragmentation under a churning
//! allocation workload.
//!
//! A run is a straight pipeline, repeated once per time step:
//!
//! ```plaintext
//! WorkloadSimulator --mutates--> HeapService <--reads-- inspect::measure
//!                                                            |
//!                                                            v
//!                                                       TimeSeries --> ResultSink
//! ```
//!
//! The allocator is reached only through [`alloc::HeapService`]. Which backend
//! [`alloc::PlatformHeap`] names is decided at build time.

pub mod alloc;
pub mod config;
pub mod inspect;
pub mod os;
pub mod series;
pub mod simulation;
pub mod sink;
pub mod util;
pub mod workload;

pub use config::SimulationConfig;
pub use inspect::HeapStats;
pub use series::{RunReport, TimeSeries};
