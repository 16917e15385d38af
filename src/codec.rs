//! Raster codec: PNG decode and JPEG encode, behind a small trait so the
//! rest of the Core never depends on the `image` crate directly. Out of
//! scope as a *contract* (§1) but a default implementation is required for
//! the crate to actually run.

use crate::error::{CoreError, CoreResult};
use crate::frame::RgbaRaster;

pub trait Codec: Send + Sync {
    /// Decodes PNG bytes into an RGBA raster, applying `rotation_degrees`
    /// (0/90/180/270) and ensuring an alpha channel is present.
    fn decode_png(&self, data: &[u8], rotation_degrees: u16) -> CoreResult<RgbaRaster>;

    /// Encodes an RGBA sub-rectangle as JPEG with 4:4:4 chroma subsampling
    /// at `quality` (1-100).
    fn encode_jpeg(
        &self,
        raster: &RgbaRaster,
        x: u32,
        y: u32,
        w: u32,
        h: u32,
        quality: u8,
    ) -> CoreResult<Vec<u8>>;
}

/// Default [`Codec`] backed by the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageCodec;

impl Codec for ImageCodec {
    fn decode_png(&self, data: &[u8], rotation_degrees: u16) -> CoreResult<RgbaRaster> {
        let img = image::load_from_memory_with_format(data, image::ImageFormat::Png)
            .map_err(|e| CoreError::DecodeFailed(e.to_string()))?;

        let rotated = match rotation_degrees {
            90 => img.rotate90(),
            180 => img.rotate180(),
            270 => img.rotate270(),
            _ => img,
        };

        let rgba = rotated.to_rgba8();
        let (width, height) = rgba.dimensions();
        Ok(RgbaRaster::new(rgba.into_raw(), width, height))
    }

    fn encode_jpeg(
        &self,
        raster: &RgbaRaster,
        x: u32,
        y: u32,
        w: u32,
        h: u32,
        quality: u8,
    ) -> CoreResult<Vec<u8>> {
        let mut tile = Vec::with_capacity(w as usize * h as usize * 3);
        for row in 0..h {
            let src_y = y + row;
            let row_start = (src_y * raster.width + x) as usize * 4;
            for col in 0..w {
                let px = row_start + col as usize * 4;
                // Drop alpha: JPEG output has no transparency channel.
                tile.extend_from_slice(&raster.data[px..px + 3]);
            }
        }

        let mut out = Vec::new();
        let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
        encoder
            .encode(&tile, w, h, image::ExtendedColorType::Rgb8)
            .map_err(|e| CoreError::EncodeFailed(e.to_string()))?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_png(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
        let mut img = image::RgbaImage::new(width, height);
        for px in img.pixels_mut() {
            *px = image::Rgba(rgba);
        }
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn decode_round_trips_dimensions() {
        let png = solid_png(8, 4, [10, 20, 30, 255]);
        let raster = ImageCodec.decode_png(&png, 0).unwrap();
        assert_eq!((raster.width, raster.height), (8, 4));
        assert_eq!(raster.data.len(), 8 * 4 * 4);
    }

    #[test]
    fn decode_rotate90_swaps_dimensions() {
        let png = solid_png(8, 4, [1, 2, 3, 255]);
        let raster = ImageCodec.decode_png(&png, 90).unwrap();
        assert_eq!((raster.width, raster.height), (4, 8));
    }

    #[test]
    fn encode_jpeg_produces_nonempty_payload() {
        let raster = RgbaRaster::new(vec![128u8; 16 * 16 * 4], 16, 16);
        let jpeg = ImageCodec.encode_jpeg(&raster, 0, 0, 16, 16, 80).unwrap();
        assert!(!jpeg.is_empty());
        // JPEG SOI marker
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn decode_invalid_bytes_fails() {
        assert!(ImageCodec.decode_png(b"not a png", 0).is_err());
    }
}
