//! Top-of-atmosphere reflectance with dark-object haze subtraction.

use ndarray::Array2;

use crate::config::PreprocessingConfig;
use crate::raster::BandSet;

/// Digital number providers use for "no data".
pub const NODATA_DN: f32 = 0.0;

#[derive(Debug, Clone, PartialEq)]
pub struct AtmosphericCorrector {
    quantification: f64,
    offset: f64,
    haze_percentile: f64,
}

impl AtmosphericCorrector {
    pub fn new(quantification: f64, offset: f64, haze_percentile: f64) -> Self {
        Self {
            quantification,
            offset,
            haze_percentile,
        }
    }

    pub fn from_config(config: &PreprocessingConfig) -> Self {
        Self::new(
            config.quantification,
            config.radiometric_offset,
            config.haze_percentile,
        )
    }

    /// DN to reflectance for a single sample. Nodata and non-finite input
    /// map to `NaN`.
    pub fn reflectance(&self, dn: f32) -> f32 {
        if !dn.is_finite() || dn == NODATA_DN {
            return f32::NAN;
        }
        ((dn as f64 + self.offset) / self.quantification) as f32
    }

    /// Corrects one band: scale to reflectance, subtract the haze estimate,
    /// clamp to `[0, 1]`.
    pub fn correct_band(&self, dn: Array2<f32>) -> Array2<f32> {
        let mut reflectance = dn.mapv(|v| self.reflectance(v));
        let haze = percentile(reflectance.iter().copied(), self.haze_percentile).unwrap_or(0.0);
        reflectance.mapv_inplace(|v| {
            if v.is_nan() {
                v
            } else {
                (v - haze).clamp(0.0, 1.0)
            }
        });
        reflectance
    }

    pub fn correct(&self, raw: BandSet) -> BandSet {
        raw.map_bands(|_, data| self.correct_band(data))
    }
}

/// Nearest-rank percentile (`p` in `[0, 100]`) of the non-`NaN` values.
pub fn percentile<I>(values: I, p: f64) -> Option<f32>
where
    I: IntoIterator<Item = f32>,
{
    let mut valid: Vec<f32> = values.into_iter().filter(|v| !v.is_nan()).collect();
    if valid.is_empty() {
        return None;
    }
    valid.sort_by(|a, b| a.total_cmp(b));
    let rank = (p.clamp(0.0, 100.0) / 100.0 * (valid.len() - 1) as f64).round() as usize;
    Some(valid[rank.min(valid.len() - 1)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::Band;
    use ndarray::array;

    #[test]
    fn test_reflectance_scaling() {
        let corrector = AtmosphericCorrector::new(10_000.0, -1000.0, 0.0);
        assert!((corrector.reflectance(3000.0) - 0.2).abs() < 1e-6);
        assert!(corrector.reflectance(NODATA_DN).is_nan());
        assert!(corrector.reflectance(f32::NAN).is_nan());
    }

    #[test]
    fn test_dark_object_subtraction() {
        let corrector = AtmosphericCorrector::new(10_000.0, 0.0, 0.0);
        let corrected = corrector.correct_band(array![[500.0, 1500.0], [2500.0, 0.0]]);
        // Darkest valid pixel (0.05) is taken as haze.
        assert!((corrected[[0, 0]] - 0.0).abs() < 1e-6);
        assert!((corrected[[0, 1]] - 0.1).abs() < 1e-6);
        assert!((corrected[[1, 0]] - 0.2).abs() < 1e-6);
        assert!(corrected[[1, 1]].is_nan());
    }

    #[test]
    fn test_output_clamped_to_unit_interval() {
        let corrector = AtmosphericCorrector::new(10_000.0, 0.0, 0.0);
        let corrected = corrector.correct_band(array![[1.0, 25_000.0]]);
        assert!(corrected.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(corrected[[0, 1]], 1.0);
    }

    #[test]
    fn test_all_nodata_band_stays_nan() {
        let corrector = AtmosphericCorrector::new(10_000.0, 0.0, 1.0);
        let corrected = corrector.correct_band(Array2::zeros((3, 3)));
        assert!(corrected.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_correct_keeps_every_band() {
        let corrector = AtmosphericCorrector::new(10_000.0, 0.0, 0.0);
        let raw = BandSet::filled(2, 2, &[(Band::Red, 2000.0), (Band::Nir, 8000.0)]);
        let corrected = corrector.correct(raw);
        assert_eq!(corrected.len(), 2);
        // Uniform bands subtract themselves entirely.
        assert!(corrected.get(Band::Nir).unwrap().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_percentile() {
        let values = [f32::NAN, 4.0, 1.0, 3.0, 2.0, 5.0];
        assert_eq!(percentile(values, 0.0), Some(1.0));
        assert_eq!(percentile(values, 50.0), Some(3.0));
        assert_eq!(percentile(values, 100.0), Some(5.0));
        assert_eq!(percentile([f32::NAN], 10.0), None);
    }
}
