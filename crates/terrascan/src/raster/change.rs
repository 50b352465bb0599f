use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

use super::index::{self, SpectralIndex};
use super::threshold::otsu_threshold;
use super::{BandSet, RasterError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeMethod {
    /// Absolute difference of one spectral index between the two dates.
    IndexDifference,
    /// Euclidean magnitude of the per-band difference vector.
    ChangeVector,
}

impl ChangeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeMethod::IndexDifference => "index_difference",
            ChangeMethod::ChangeVector => "change_vector",
        }
    }
}

/// Thresholded change between two co-registered rasters.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeResult {
    /// `true` where the magnitude is valid and strictly above `threshold`.
    pub mask: Array2<bool>,
    pub magnitude: Array2<f32>,
    pub threshold: f32,
    pub changed_pixels: usize,
    pub valid_pixels: usize,
}

fn ensure_same_shape(a: &Array2<f32>, b: &Array2<f32>) -> Result<(), RasterError> {
    if a.dim() != b.dim() {
        return Err(RasterError::ShapeMismatch {
            expected: a.dim(),
            found: b.dim(),
        });
    }
    Ok(())
}

/// `|index(after) - index(before)|` per pixel.
pub fn index_difference(
    before: &BandSet,
    after: &BandSet,
    index: SpectralIndex,
) -> Result<Array2<f32>, RasterError> {
    let a = index::compute(index, before)?;
    let b = index::compute(index, after)?;
    ensure_same_shape(&a, &b)?;
    Ok(Zip::from(&a).and(&b).map_collect(|x, y| (y - x).abs()))
}

/// Euclidean norm of the difference over the bands both dates share.
/// A pixel with `NaN` in any shared band is `NaN`.
pub fn change_vector_magnitude(
    before: &BandSet,
    after: &BandSet,
) -> Result<Array2<f32>, RasterError> {
    let shared: Vec<_> = before
        .iter()
        .filter_map(|(band, data)| after.get(band).map(|other| (data, other)))
        .collect();
    let Some((first, _)) = shared.first() else {
        return Err(RasterError::NoSharedBands);
    };

    let shape = first.dim();
    let mut sum_sq = Array2::<f64>::zeros(shape);
    for (a, b) in &shared {
        ensure_same_shape(first, a)?;
        ensure_same_shape(a, b)?;
        Zip::from(&mut sum_sq).and(*a).and(*b).for_each(|acc, x, y| {
            let d = f64::from(*y) - f64::from(*x);
            *acc += d * d;
        });
    }
    Ok(sum_sq.mapv(|s| s.sqrt() as f32))
}

/// Thresholds a magnitude raster with Otsu's method.
pub fn threshold_change(magnitude: Array2<f32>) -> ChangeResult {
    let threshold = otsu_threshold(magnitude.iter());
    let mask = magnitude.mapv(|m| !m.is_nan() && m > threshold);
    let changed_pixels = mask.iter().filter(|m| **m).count();
    let valid_pixels = magnitude.iter().filter(|m| !m.is_nan()).count();
    ChangeResult {
        mask,
        magnitude,
        threshold,
        changed_pixels,
        valid_pixels,
    }
}

/// Runs a change detection method end to end.
pub fn detect(
    method: ChangeMethod,
    index: Option<SpectralIndex>,
    before: &BandSet,
    after: &BandSet,
) -> Result<ChangeResult, RasterError> {
    let magnitude = match method {
        ChangeMethod::IndexDifference => {
            let index = index.ok_or(RasterError::IndexRequired)?;
            index_difference(before, after, index)?
        }
        ChangeMethod::ChangeVector => change_vector_magnitude(before, after)?,
    };
    Ok(threshold_change(magnitude))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::Band;
    use ndarray::array;

    fn scene(nir: Array2<f32>, red: Array2<f32>) -> BandSet {
        BandSet::new()
            .with_band(Band::Nir, nir)
            .unwrap()
            .with_band(Band::Red, red)
            .unwrap()
    }

    #[test]
    fn test_index_difference_flags_cleared_vegetation() {
        let before = scene(
            array![[0.8, 0.8], [0.8, 0.8]],
            array![[0.2, 0.2], [0.2, 0.2]],
        );
        // Bottom row cleared: NDVI drops from 0.6 to ~0.
        let after = scene(
            array![[0.8, 0.8], [0.3, 0.3]],
            array![[0.2, 0.2], [0.3, 0.3]],
        );
        let result = detect(
            ChangeMethod::IndexDifference,
            Some(SpectralIndex::Ndvi),
            &before,
            &after,
        )
        .unwrap();
        assert_eq!(result.valid_pixels, 4);
        assert_eq!(result.changed_pixels, 2);
        assert_eq!(result.mask, array![[false, false], [true, true]]);
    }

    #[test]
    fn test_change_vector_magnitude() {
        let before = scene(array![[0.0]], array![[0.0]]);
        let after = scene(array![[0.3]], array![[0.4]]);
        let magnitude = change_vector_magnitude(&before, &after).unwrap();
        assert!((magnitude[[0, 0]] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_shape_mismatch_between_dates() {
        let before = scene(Array2::zeros((2, 2)), Array2::zeros((2, 2)));
        let after = scene(Array2::zeros((3, 2)), Array2::zeros((3, 2)));
        let err = change_vector_magnitude(&before, &after).unwrap_err();
        assert!(matches!(err, RasterError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_no_shared_bands() {
        let before = BandSet::filled(1, 1, &[(Band::Blue, 0.1)]);
        let after = BandSet::filled(1, 1, &[(Band::Swir1, 0.1)]);
        assert_eq!(
            change_vector_magnitude(&before, &after).unwrap_err(),
            RasterError::NoSharedBands
        );
    }

    #[test]
    fn test_index_difference_requires_index() {
        let set = BandSet::filled(1, 1, &[(Band::Nir, 0.5), (Band::Red, 0.1)]);
        assert_eq!(
            detect(ChangeMethod::IndexDifference, None, &set, &set).unwrap_err(),
            RasterError::IndexRequired
        );
    }

    #[test]
    fn test_all_invalid_pixels_do_not_fail() {
        let before = BandSet::filled(2, 2, &[(Band::Nir, 0.0), (Band::Red, 0.0)]);
        let result = detect(
            ChangeMethod::IndexDifference,
            Some(SpectralIndex::Ndvi),
            &before,
            &before,
        )
        .unwrap();
        assert_eq!(result.threshold, 0.0);
        assert_eq!(result.valid_pixels, 0);
        assert_eq!(result.changed_pixels, 0);
    }

    #[test]
    fn test_identical_scenes_have_no_change() {
        let set = BandSet::filled(3, 3, &[(Band::Nir, 0.6), (Band::Red, 0.1)]);
        let result = detect(ChangeMethod::ChangeVector, None, &set, &set).unwrap();
        assert_eq!(result.threshold, 0.0);
        assert_eq!(result.changed_pixels, 0);
        assert_eq!(result.valid_pixels, 9);
    }
}
