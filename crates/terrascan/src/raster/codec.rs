//! Multi-layer raster files.
//!
//! Each layer is stored as its own TIFF image directory with `f32` samples,
//! strip-organized so readers can seek to a row range without decoding the
//! whole layer. The layer name is kept in the `ImageDescription` tag.

use std::io::Cursor;

use ndarray::Array2;
use thiserror::Error;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

use super::{Band, BandSet, RasterError};

/// Rows per strip used when no other value is configured.
pub const DEFAULT_STRIP_ROWS: u32 = 256;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("Cannot encode an empty raster layer '{0}'")]
    EmptyLayer(String),

    #[error("Raster contains no image layers")]
    NoLayers,

    #[error("Unsupported sample format in layer {layer}")]
    UnsupportedSamples { layer: usize },

    #[error("Layer {layer} holds {found} samples for a {width}x{height} image")]
    SampleCount {
        layer: usize,
        width: u32,
        height: u32,
        found: usize,
    },

    #[error("Layer {layer} is not a known band: {name:?}")]
    UnknownBand { layer: usize, name: Option<String> },

    #[error(transparent)]
    Raster(#[from] RasterError),
}

/// A decoded layer: its name (if tagged) and samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub name: Option<String>,
    pub data: Array2<f32>,
}

/// Encodes named layers into one TIFF file, one image directory per layer.
pub fn encode_layers(layers: &[(&str, &Array2<f32>)], strip_rows: u32) -> Result<Vec<u8>, CodecError> {
    if layers.is_empty() {
        return Err(CodecError::NoLayers);
    }

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut encoder = TiffEncoder::new(&mut cursor)?;
        for (name, data) in layers {
            let (rows, cols) = data.dim();
            if rows == 0 || cols == 0 {
                return Err(CodecError::EmptyLayer(name.to_string()));
            }
            let mut image = encoder.new_image::<colortype::Gray32Float>(cols as u32, rows as u32)?;
            image.encoder().write_tag(Tag::ImageDescription, *name)?;
            image.rows_per_strip(strip_rows.clamp(1, rows as u32))?;
            let samples: Vec<f32> = data.iter().copied().collect();
            image.write_data(&samples)?;
        }
    }
    Ok(cursor.into_inner())
}

/// Encodes a band set, naming each layer after its band.
pub fn encode_bands(bands: &BandSet, strip_rows: u32) -> Result<Vec<u8>, CodecError> {
    let layers: Vec<(&str, &Array2<f32>)> = bands.iter().map(|(b, data)| (b.as_str(), data)).collect();
    encode_layers(&layers, strip_rows)
}

/// Decodes every image directory of a TIFF file into `f32` layers.
///
/// Integer sample formats (e.g. raw 16-bit digital numbers) are widened to
/// `f32`; multi-channel images are rejected.
pub fn decode_layers(bytes: &[u8]) -> Result<Vec<Layer>, CodecError> {
    let mut decoder = Decoder::new(Cursor::new(bytes))?;
    let mut layers = Vec::new();
    loop {
        let index = layers.len();
        let (width, height) = decoder.dimensions()?;
        let name = decoder
            .get_tag_ascii_string(Tag::ImageDescription)
            .ok()
            .map(|n| n.trim_end_matches('\0').to_string());
        let samples = widen(index, decoder.read_image()?)?;
        let found = samples.len();
        let data = Array2::from_shape_vec((height as usize, width as usize), samples).map_err(|_| {
            CodecError::SampleCount {
                layer: index,
                width,
                height,
                found,
            }
        })?;
        layers.push(Layer { name, data });

        if !decoder.more_images() {
            break;
        }
        decoder.next_image()?;
    }
    Ok(layers)
}

fn widen(layer: usize, image: DecodingResult) -> Result<Vec<f32>, CodecError> {
    let samples = match image {
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        _ => return Err(CodecError::UnsupportedSamples { layer }),
    };
    Ok(samples)
}

/// Decodes a file written by [`encode_bands`] back into a band set.
pub fn decode_bands(bytes: &[u8]) -> Result<BandSet, CodecError> {
    let mut bands = BandSet::new();
    for (layer, Layer { name, data }) in decode_layers(bytes)?.into_iter().enumerate() {
        let band = name
            .as_deref()
            .and_then(Band::from_asset_key)
            .ok_or_else(|| CodecError::UnknownBand {
                layer,
                name: name.clone(),
            })?;
        bands.insert(band, data)?;
    }
    Ok(bands)
}

/// Decodes the first image of a single-band file, e.g. a downloaded asset.
pub fn decode_single_band(bytes: &[u8]) -> Result<Array2<f32>, CodecError> {
    decode_layers(bytes)?
        .into_iter()
        .next()
        .map(|layer| layer.data)
        .ok_or(CodecError::NoLayers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_band_set_survives_encoding() {
        let bands = BandSet::new()
            .with_band(Band::Red, array![[0.1, 0.2, 0.3], [0.4, f32::NAN, 0.6]])
            .unwrap()
            .with_band(Band::Nir, array![[0.7, 0.8, 0.9], [1.0, 0.0, 0.5]])
            .unwrap();
        let bytes = encode_bands(&bands, 1).unwrap();
        let decoded = decode_bands(&bytes).unwrap();

        assert_eq!(decoded.len(), 2);
        let red = decoded.require(Band::Red).unwrap();
        assert_eq!(red.dim(), (2, 3));
        assert_eq!(red[[0, 2]], 0.3);
        assert!(red[[1, 1]].is_nan());
        assert_eq!(decoded.require(Band::Nir).unwrap()[[1, 0]], 1.0);
    }

    #[test]
    fn test_layer_names_are_kept() {
        let magnitude = array![[0.0f32, 1.0]];
        let mask = array![[0.0f32, 1.0]];
        let bytes = encode_layers(&[("magnitude", &magnitude), ("mask", &mask)], DEFAULT_STRIP_ROWS).unwrap();
        let layers = decode_layers(&bytes).unwrap();
        let names: Vec<_> = layers.iter().map(|l| l.name.clone()).collect();
        assert_eq!(names, vec![Some("magnitude".to_string()), Some("mask".to_string())]);
    }

    #[test]
    fn test_empty_layer_rejected() {
        let empty = Array2::<f32>::zeros((0, 4));
        assert!(matches!(
            encode_layers(&[("ndvi", &empty)], DEFAULT_STRIP_ROWS),
            Err(CodecError::EmptyLayer(_))
        ));
        assert!(matches!(encode_layers(&[], DEFAULT_STRIP_ROWS), Err(CodecError::NoLayers)));
    }

    #[test]
    fn test_garbage_is_a_tiff_error() {
        assert!(matches!(
            decode_layers(b"definitely not a tiff"),
            Err(CodecError::Tiff(_))
        ));
    }
}
