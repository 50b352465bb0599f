//! Blob storage for rasters.
//!
//! Everything large (downloaded assets, intermediate and analysis-ready
//! rasters, job results) lives behind the [`BlobStore`] trait; the catalog
//! only records keys.

pub mod blob;

pub use blob::{keys, BlobStore, FileBlobStore};
