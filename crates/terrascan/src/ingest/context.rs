use crate::model::ImagerySource;
use crate::raster::BandSet;
use crate::remote::SceneCandidate;

/// State threaded through the preprocessing steps of one scene.
pub struct SceneContext {
    // Input
    pub scene: ImagerySource,
    pub candidate: SceneCandidate,

    // Raw digital numbers after download, reflectance after correction,
    // masked reflectance after masking.
    pub bands: Option<BandSet>,

    // Band assets found in the blob store instead of downloaded
    pub reused_assets: usize,

    pub masked_pixels: usize,

    // Encoded analysis-ready raster, set by conversion
    pub raster: Option<Vec<u8>>,

    pub storage_uri: Option<String>,
}

impl SceneContext {
    pub fn new(scene: ImagerySource, candidate: SceneCandidate) -> Self {
        Self {
            scene,
            candidate,
            bands: None,
            reused_assets: 0,
            masked_pixels: 0,
            raster: None,
            storage_uri: None,
        }
    }
}
