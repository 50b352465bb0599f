//! Pure raster computations: band containers, spectral indices, change
//! detection, histogram thresholding and the on-disk raster codec.
//!
//! Nothing in here performs I/O except `codec`, which only works on
//! in-memory byte buffers.

pub mod band;
pub mod change;
pub mod codec;
pub mod index;
pub mod threshold;

use thiserror::Error;

pub use band::{resample_nearest, Band, BandSet};
pub use change::{ChangeMethod, ChangeResult};
pub use codec::CodecError;
pub use index::{IndexStats, SpectralIndex};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RasterError {
    #[error("Required band '{0}' is missing")]
    MissingBand(Band),

    #[error("Raster shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Preview buffer for band '{band}' has {found} samples, expected {expected}")]
    BufferLength {
        band: Band,
        expected: usize,
        found: usize,
    },

    #[error("The two rasters share no bands")]
    NoSharedBands,

    #[error("Index differencing requires an index selector")]
    IndexRequired,
}
