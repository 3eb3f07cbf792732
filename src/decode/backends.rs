use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegDecoder;
use image::{ColorType, ImageDecoder};
use std::io::Cursor;

use super::backend::{DecoderBackend, RawImage};

/// JPEG-only decoder reading straight into an RGB buffer.
///
/// Accepts baseline/progressive color and grayscale JPEGs. Anything else is
/// left to the fallback backend.
#[derive(Clone, Copy, Debug, Default)]
pub struct JpegFastBackend;

impl DecoderBackend for JpegFastBackend {
    fn name(&self) -> &'static str {
        "jpeg-fast"
    }

    fn decode(&self, bytes: &[u8]) -> Result<RawImage> {
        let decoder = JpegDecoder::new(Cursor::new(bytes)).context("read jpeg header")?;
        let (width, height) = decoder.dimensions();
        let color = decoder.color_type();
        let total = usize::try_from(decoder.total_bytes())
            .map_err(|_| anyhow!("jpeg {}x{} too large for this platform", width, height))?;
        let mut buf = vec![0u8; total];
        decoder.read_image(&mut buf).context("decode jpeg scan")?;

        let pixels = match color {
            ColorType::Rgb8 => buf,
            ColorType::L8 => buf.iter().flat_map(|&v| [v, v, v]).collect(),
            other => return Err(anyhow!("unsupported jpeg color type {:?}", other)),
        };
        Ok(RawImage {
            pixels,
            width,
            height,
        })
    }
}

/// Format-sniffing decoder, slower but more permissive.
#[derive(Clone, Copy, Debug, Default)]
pub struct GenericBackend;

impl DecoderBackend for GenericBackend {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn decode(&self, bytes: &[u8]) -> Result<RawImage> {
        let rgb = image::load_from_memory(bytes)
            .context("decode image")?
            .to_rgb8();
        let (width, height) = rgb.dimensions();
        Ok(RawImage {
            pixels: rgb.into_raw(),
            width,
            height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;
    use image::ExtendedColorType;

    fn encode(width: u32, height: u32, pixels: &[u8], color: ExtendedColorType) -> Vec<u8> {
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 95)
            .encode(pixels, width, height, color)
            .unwrap();
        out
    }

    #[test]
    fn fast_backend_decodes_rgb() {
        let jpeg = encode(16, 8, &[120u8; 16 * 8 * 3], ExtendedColorType::Rgb8);
        let image = JpegFastBackend.decode(&jpeg).unwrap();
        assert_eq!((image.width, image.height), (16, 8));
        assert_eq!(image.pixels.len(), 16 * 8 * 3);
    }

    #[test]
    fn fast_backend_expands_grayscale() {
        let jpeg = encode(12, 12, &[200u8; 12 * 12], ExtendedColorType::L8);
        let image = JpegFastBackend.decode(&jpeg).unwrap();
        assert_eq!(image.pixels.len(), 12 * 12 * 3);
        assert_eq!(image.pixels[0], image.pixels[1]);
    }

    #[test]
    fn both_backends_reject_garbage() {
        let garbage = [0xFF, 0xD8, 0x00, 0x01, 0x02, 0xFF, 0xD9];
        assert!(JpegFastBackend.decode(&garbage).is_err());
        assert!(GenericBackend.decode(&garbage).is_err());
    }

    #[test]
    fn generic_backend_matches_fast_dimensions() {
        let jpeg = encode(20, 10, &[50u8; 20 * 10 * 3], ExtendedColorType::Rgb8);
        let fast = JpegFastBackend.decode(&jpeg).unwrap();
        let generic = GenericBackend.decode(&jpeg).unwrap();
        assert_eq!((fast.width, fast.height), (generic.width, generic.height));
    }
}
