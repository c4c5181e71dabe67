#![warn(
    clippy::all,
    clippy::correctness,
    clippy::suspicious,
    clippy::style,
    clippy::complexity,
    clippy::perf,
    nonstandard_style
)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod dijkstra;
pub mod error;
pub mod graph;
pub mod grid;
pub mod webmercator;

pub use error::Error;
pub use graph::{CompactNetwork, EdgeList};
pub use grid::{CostGrid, PixelExtent};

/// Cooperative cancellation for the CPU-heavy phases. The flag is checked
/// between Dijkstra runs and between batches of painted edges; setting it
/// makes the running computation return [`Error::Cancelled`].
#[derive(Clone, Debug, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
