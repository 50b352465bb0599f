use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::RasterError;

/// Spectral bands the index engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    Blue,
    Green,
    Red,
    Nir,
    Swir1,
    Swir2,
}

impl Band {
    pub const ALL: [Band; 6] = [
        Band::Blue,
        Band::Green,
        Band::Red,
        Band::Nir,
        Band::Swir1,
        Band::Swir2,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Band::Blue => "blue",
            Band::Green => "green",
            Band::Red => "red",
            Band::Nir => "nir",
            Band::Swir1 => "swir1",
            Band::Swir2 => "swir2",
        }
    }

    /// Maps a STAC asset key (common name or Sentinel-2 band id) to a band.
    pub fn from_asset_key(key: &str) -> Option<Band> {
        match key.to_ascii_lowercase().as_str() {
            "blue" | "b02" | "b2" => Some(Band::Blue),
            "green" | "b03" | "b3" => Some(Band::Green),
            "red" | "b04" | "b4" => Some(Band::Red),
            "nir" | "nir08" | "b08" | "b8" => Some(Band::Nir),
            "swir1" | "swir16" | "b11" => Some(Band::Swir1),
            "swir2" | "swir22" | "b12" => Some(Band::Swir2),
            _ => None,
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Band {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Band::from_asset_key(s).ok_or_else(|| format!("unknown band '{}'", s))
    }
}

/// A collection of same-shaped bands of one scene, in reflectance units.
/// `NaN` marks pixels without valid data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BandSet {
    bands: BTreeMap<Band, Array2<f32>>,
}

impl BandSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A band set where every band holds a single constant value.
    pub fn filled(rows: usize, cols: usize, values: &[(Band, f32)]) -> Self {
        let bands = values
            .iter()
            .map(|(band, value)| (*band, Array2::from_elem((rows, cols), *value)))
            .collect();
        Self { bands }
    }

    /// Adds or replaces a band. Every band must share the same shape.
    pub fn insert(&mut self, band: Band, data: Array2<f32>) -> Result<(), RasterError> {
        if let Some(expected) = self.shape() {
            let replacing_only_band = self.bands.len() == 1 && self.bands.contains_key(&band);
            if data.dim() != expected && !replacing_only_band {
                return Err(RasterError::ShapeMismatch {
                    expected,
                    found: data.dim(),
                });
            }
        }
        self.bands.insert(band, data);
        Ok(())
    }

    pub fn with_band(mut self, band: Band, data: Array2<f32>) -> Result<Self, RasterError> {
        self.insert(band, data)?;
        Ok(self)
    }

    pub fn get(&self, band: Band) -> Option<&Array2<f32>> {
        self.bands.get(&band)
    }

    pub fn require(&self, band: Band) -> Result<&Array2<f32>, RasterError> {
        self.bands.get(&band).ok_or(RasterError::MissingBand(band))
    }

    /// `(rows, cols)` of the set, or `None` when empty.
    pub fn shape(&self) -> Option<(usize, usize)> {
        self.bands.values().next().map(|a| a.dim())
    }

    pub fn bands(&self) -> impl Iterator<Item = Band> + '_ {
        self.bands.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Band, &Array2<f32>)> {
        self.bands.iter().map(|(b, a)| (*b, a))
    }

    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    /// Replaces every band by `f(band, data)`.
    pub fn map_bands<F>(self, mut f: F) -> Self
    where
        F: FnMut(Band, Array2<f32>) -> Array2<f32>,
    {
        let bands = self
            .bands
            .into_iter()
            .map(|(band, data)| {
                let mapped = f(band, data);
                (band, mapped)
            })
            .collect();
        Self { bands }
    }

    /// Sets every band to `NaN` where `mask` is true. Returns the number of
    /// masked pixels.
    pub fn apply_mask(&mut self, mask: &Array2<bool>) -> Result<usize, RasterError> {
        if let Some(expected) = self.shape() {
            if mask.dim() != expected {
                return Err(RasterError::ShapeMismatch {
                    expected,
                    found: mask.dim(),
                });
            }
        }
        for data in self.bands.values_mut() {
            ndarray::Zip::from(data).and(mask).for_each(|v, &masked| {
                if masked {
                    *v = f32::NAN;
                }
            });
        }
        Ok(mask.iter().filter(|m| **m).count())
    }
}

/// Nearest-neighbour resampling onto a `(rows, cols)` grid covering the same
/// extent. Used to bring coarser bands (e.g. 20 m SWIR) onto the finest grid.
pub fn resample_nearest(src: &Array2<f32>, shape: (usize, usize)) -> Array2<f32> {
    let (src_rows, src_cols) = src.dim();
    if (src_rows, src_cols) == shape {
        return src.clone();
    }
    let (rows, cols) = shape;
    if src_rows == 0 || src_cols == 0 {
        return Array2::from_elem(shape, f32::NAN);
    }
    Array2::from_shape_fn((rows, cols), |(r, c)| {
        let sr = ((r as f64 + 0.5) * src_rows as f64 / rows as f64) as usize;
        let sc = ((c as f64 + 0.5) * src_cols as f64 / cols as f64) as usize;
        src[[sr.min(src_rows - 1), sc.min(src_cols - 1)]]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_asset_key_aliases() {
        assert_eq!(Band::from_asset_key("B04"), Some(Band::Red));
        assert_eq!(Band::from_asset_key("nir08"), Some(Band::Nir));
        assert_eq!(Band::from_asset_key("swir16"), Some(Band::Swir1));
        assert_eq!(Band::from_asset_key("swir22"), Some(Band::Swir2));
        assert_eq!(Band::from_asset_key("thumbnail"), None);
    }

    #[test]
    fn test_insert_rejects_mismatched_shape() {
        let mut set = BandSet::new();
        set.insert(Band::Red, Array2::zeros((2, 2))).unwrap();
        let err = set.insert(Band::Nir, Array2::zeros((3, 2))).unwrap_err();
        assert_eq!(
            err,
            RasterError::ShapeMismatch {
                expected: (2, 2),
                found: (3, 2)
            }
        );
    }

    #[test]
    fn test_require_reports_missing_band() {
        let set = BandSet::filled(1, 1, &[(Band::Red, 0.1)]);
        assert_eq!(
            set.require(Band::Nir).unwrap_err(),
            RasterError::MissingBand(Band::Nir)
        );
    }

    #[test]
    fn test_apply_mask_sets_nan_in_every_band() {
        let mut set = BandSet::filled(2, 2, &[(Band::Red, 0.1), (Band::Nir, 0.5)]);
        let mask = array![[true, false], [false, true]];
        let masked = set.apply_mask(&mask).unwrap();
        assert_eq!(masked, 2);
        for (_, data) in set.iter() {
            assert!(data[[0, 0]].is_nan());
            assert!(!data[[0, 1]].is_nan());
            assert!(data[[1, 1]].is_nan());
        }
    }

    #[test]
    fn test_resample_doubles_resolution() {
        let src = array![[1.0f32, 2.0], [3.0, 4.0]];
        let up = resample_nearest(&src, (4, 4));
        assert_eq!(up.dim(), (4, 4));
        assert_eq!(up[[0, 0]], 1.0);
        assert_eq!(up[[1, 1]], 1.0);
        assert_eq!(up[[0, 3]], 2.0);
        assert_eq!(up[[3, 0]], 3.0);
        assert_eq!(up[[3, 3]], 4.0);
    }
}
