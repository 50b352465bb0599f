use std::fmt;
use std::str::FromStr;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::{Band, BandSet, RasterError};

/// Denominators whose magnitude falls below this produce `NaN`.
pub const DENOMINATOR_EPSILON: f64 = 1e-10;

const SAVI_L: f64 = 0.5;
const EVI_G: f64 = 2.5;
const EVI_C1: f64 = 6.0;
const EVI_C2: f64 = 7.5;
const EVI_L: f64 = 1.0;

/// Per-pixel band-ratio indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpectralIndex {
    /// Vegetation: `(nir - red) / (nir + red)`.
    Ndvi,
    /// Open water: `(green - nir) / (green + nir)`.
    Ndwi,
    /// Built-up area: `(swir1 - nir) / (swir1 + nir)`.
    Ndbi,
    /// Burn severity: `(nir - swir2) / (nir + swir2)`.
    Nbr,
    /// Soil-adjusted vegetation.
    Savi,
    /// Enhanced vegetation.
    Evi,
}

impl SpectralIndex {
    pub const ALL: [SpectralIndex; 6] = [
        SpectralIndex::Ndvi,
        SpectralIndex::Ndwi,
        SpectralIndex::Ndbi,
        SpectralIndex::Nbr,
        SpectralIndex::Savi,
        SpectralIndex::Evi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SpectralIndex::Ndvi => "ndvi",
            SpectralIndex::Ndwi => "ndwi",
            SpectralIndex::Ndbi => "ndbi",
            SpectralIndex::Nbr => "nbr",
            SpectralIndex::Savi => "savi",
            SpectralIndex::Evi => "evi",
        }
    }

    /// Bands the kernel reads, in the order `evaluate` expects them.
    pub fn required_bands(&self) -> &'static [Band] {
        match self {
            SpectralIndex::Ndvi | SpectralIndex::Savi => &[Band::Nir, Band::Red],
            SpectralIndex::Ndwi => &[Band::Green, Band::Nir],
            SpectralIndex::Ndbi => &[Band::Swir1, Band::Nir],
            SpectralIndex::Nbr => &[Band::Nir, Band::Swir2],
            SpectralIndex::Evi => &[Band::Nir, Band::Red, Band::Blue],
        }
    }

    /// Evaluates the index for one pixel. `samples` holds the values of
    /// `required_bands()` in the same order.
    ///
    /// Never fails: missing samples, `NaN` inputs and degenerate
    /// denominators all yield `NaN`.
    pub fn evaluate(&self, samples: &[f32]) -> f32 {
        let arity = self.required_bands().len();
        if samples.len() < arity {
            return f32::NAN;
        }
        let s = |i: usize| f64::from(samples[i]);
        match self {
            SpectralIndex::Ndvi | SpectralIndex::Ndwi | SpectralIndex::Ndbi | SpectralIndex::Nbr => {
                normalized_difference(samples[0], samples[1])
            }
            SpectralIndex::Savi => {
                let (nir, red) = (s(0), s(1));
                safe_ratio((1.0 + SAVI_L) * (nir - red), nir + red + SAVI_L)
            }
            SpectralIndex::Evi => {
                let (nir, red, blue) = (s(0), s(1), s(2));
                safe_ratio(
                    EVI_G * (nir - red),
                    nir + EVI_C1 * red - EVI_C2 * blue + EVI_L,
                )
            }
        }
    }
}

impl fmt::Display for SpectralIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpectralIndex {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SpectralIndex::ALL
            .iter()
            .find(|index| index.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| format!("unknown spectral index '{}'", s))
    }
}

/// `(a - b) / (a + b)`, or `NaN` when the sum is degenerate.
pub fn normalized_difference(a: f32, b: f32) -> f32 {
    let (a, b) = (f64::from(a), f64::from(b));
    safe_ratio(a - b, a + b)
}

fn safe_ratio(numerator: f64, denominator: f64) -> f32 {
    if numerator.is_nan() || denominator.is_nan() || denominator.abs() < DENOMINATOR_EPSILON {
        return f32::NAN;
    }
    (numerator / denominator) as f32
}

/// Computes an index over a full band set.
pub fn compute(index: SpectralIndex, bands: &BandSet) -> Result<Array2<f32>, RasterError> {
    let inputs = index
        .required_bands()
        .iter()
        .map(|band| bands.require(*band))
        .collect::<Result<Vec<_>, _>>()?;

    let shape = inputs[0].dim();
    for input in &inputs[1..] {
        if input.dim() != shape {
            return Err(RasterError::ShapeMismatch {
                expected: shape,
                found: input.dim(),
            });
        }
    }

    let mut samples = [0f32; 3];
    Ok(Array2::from_shape_fn(shape, |(r, c)| {
        for (slot, input) in samples.iter_mut().zip(&inputs) {
            *slot = input[[r, c]];
        }
        index.evaluate(&samples[..inputs.len()])
    }))
}

/// Computes an index over small row-major tiles held as flat slices.
///
/// Shares the per-pixel kernel with [`compute`], so a preview tile yields
/// exactly the values the batch path would for the same pixels.
pub fn compute_preview(
    index: SpectralIndex,
    width: usize,
    height: usize,
    bands: &[(Band, &[f32])],
) -> Result<Vec<f32>, RasterError> {
    let expected = width * height;
    let inputs = index
        .required_bands()
        .iter()
        .map(|band| {
            let (_, data) = bands
                .iter()
                .find(|(b, _)| b == band)
                .ok_or(RasterError::MissingBand(*band))?;
            if data.len() != expected {
                return Err(RasterError::BufferLength {
                    band: *band,
                    expected,
                    found: data.len(),
                });
            }
            Ok(*data)
        })
        .collect::<Result<Vec<&[f32]>, _>>()?;

    let mut samples = [0f32; 3];
    Ok((0..expected)
        .map(|i| {
            for (slot, input) in samples.iter_mut().zip(&inputs) {
                *slot = input[i];
            }
            index.evaluate(&samples[..inputs.len()])
        })
        .collect())
}

/// Summary statistics over the valid pixels of a raster.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub min: Option<f32>,
    pub max: Option<f32>,
    pub mean: Option<f64>,
    pub valid_pixels: usize,
    pub total_pixels: usize,
}

pub fn summarize(data: &Array2<f32>) -> IndexStats {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    let mut sum = 0f64;
    let mut valid = 0usize;
    for &v in data.iter().filter(|v| v.is_finite()) {
        min = min.min(v);
        max = max.max(v);
        sum += f64::from(v);
        valid += 1;
    }
    IndexStats {
        min: (valid > 0).then_some(min),
        max: (valid > 0).then_some(max),
        mean: (valid > 0).then(|| sum / valid as f64),
        valid_pixels: valid,
        total_pixels: data.len(),
    }
}
