//! Tile diffing and full-frame forcing: the part of the pipeline that turns a
//! decoded raster into the rectangle set the broadcaster actually ships.

use std::collections::HashMap;
use std::sync::Arc;

use rayon::prelude::*;

use crate::codec::Codec;
use crate::config::DeviceConfig;
use crate::frame::{CodecTag, FrameOut, Rect, RgbaRaster};
use crate::hash::fnv1a32;

/// Tile-diffing frame processor. One instance lives per [`crate::session::DeviceSession`]
/// and is never shared across devices.
pub struct FrameProcessor {
    config: DeviceConfig,
    codec: Arc<dyn Codec>,
    prev_raster: Option<RgbaRaster>,
    tile_hashes: HashMap<(u32, u32), u32>,
    processed_count: u32,
    full_frame_requested: bool,
}

impl FrameProcessor {
    pub fn new(config: DeviceConfig, codec: Arc<dyn Codec>) -> Self {
        Self {
            config,
            codec,
            prev_raster: None,
            tile_hashes: HashMap::new(),
            processed_count: 0,
            full_frame_requested: true, // first frame of the session is always full
        }
    }

    /// Latches a one-shot full-frame request, consumed on the next `process_frame`.
    pub fn request_full_frame(&mut self) {
        self.full_frame_requested = true;
    }

    pub fn process_frame(&mut self, raster: &RgbaRaster) -> FrameOut {
        let tiles_x = raster.width.div_ceil(self.config.tile_size);
        let tiles_y = raster.height.div_ceil(self.config.tile_size);
        let total_tiles = (tiles_x * tiles_y).max(1);

        let is_first_frame = self.prev_raster.is_none();
        let changed = self.changed_tiles(raster, tiles_x, tiles_y);

        let force_full = self.full_frame_requested
            || changed.len() as u32 >= self.config.full_frame_tile_count
            || changed.len() as f32 / total_tiles as f32 >= self.config.full_frame_area_threshold
            || is_first_frame
            || (self.config.full_frame_every > 0
                && (self.processed_count + 1) % self.config.full_frame_every == 0);

        self.full_frame_requested = false;
        self.processed_count += 1;

        let out = if force_full {
            self.encode_full_frame(raster)
        } else if changed.is_empty() {
            FrameOut { rects: Vec::new(), codec: CodecTag::Jpeg444, is_full_frame: false }
        } else {
            self.encode_changed_tiles(raster, &changed)
        };

        self.commit_tile_hashes(raster, tiles_x, tiles_y);
        self.prev_raster = Some(raster.clone());
        out
    }

    /// Returns the set of (tile_x, tile_y) coordinates whose content hash differs
    /// from the last committed value.
    fn changed_tiles(&self, raster: &RgbaRaster, tiles_x: u32, tiles_y: u32) -> Vec<(u32, u32)> {
        let mut changed = Vec::new();
        for ty in 0..tiles_y {
            for tx in 0..tiles_x {
                let (x, y, w, h) = self.tile_rect(tx, ty, raster.width, raster.height);
                let hash = fnv1a32(&tile_bytes(raster, x, y, w, h));
                let prior = self.tile_hashes.get(&(tx, ty));
                if prior != Some(&hash) {
                    changed.push((tx, ty));
                }
            }
        }
        changed
    }

    fn commit_tile_hashes(&mut self, raster: &RgbaRaster, tiles_x: u32, tiles_y: u32) {
        for ty in 0..tiles_y {
            for tx in 0..tiles_x {
                let (x, y, w, h) = self.tile_rect(tx, ty, raster.width, raster.height);
                let hash = fnv1a32(&tile_bytes(raster, x, y, w, h));
                self.tile_hashes.insert((tx, ty), hash);
            }
        }
    }

    fn tile_rect(&self, tx: u32, ty: u32, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let x = tx * self.config.tile_size;
        let y = ty * self.config.tile_size;
        let w = self.config.tile_size.min(width - x);
        let h = self.config.tile_size.min(height - y);
        (x, y, w, h)
    }

    fn encode_full_frame(&self, raster: &RgbaRaster) -> FrameOut {
        match self.codec.encode_jpeg(raster, 0, 0, raster.width, raster.height, self.config.jpeg_quality) {
            Ok(payload) => FrameOut {
                rects: vec![Rect { x: 0, y: 0, w: raster.width, h: raster.height, payload: payload.into() }],
                codec: CodecTag::Jpeg444,
                is_full_frame: true,
            },
            Err(e) => {
                tracing::warn!(error = %e, "full-frame encode failed, emitting no change");
                FrameOut { rects: Vec::new(), codec: CodecTag::Jpeg444, is_full_frame: false }
            }
        }
    }

    /// Merges adjacent changed tiles in the same row into wider rectangles, then
    /// encodes each merged rectangle, in parallel when there is more than one.
    fn encode_changed_tiles(&self, raster: &RgbaRaster, changed: &[(u32, u32)]) -> FrameOut {
        let merged = self.merge_row_runs(changed, raster.width, raster.height);

        let encode_one = |(x, y, w, h): (u32, u32, u32, u32)| -> Option<Rect> {
            match self.codec.encode_jpeg(raster, x, y, w, h, self.config.jpeg_quality) {
                Ok(payload) => Some(Rect { x, y, w, h, payload: payload.into() }),
                Err(e) => {
                    tracing::warn!(x, y, w, h, error = %e, "tile encode failed, skipping");
                    None
                }
            }
        };

        let rects: Vec<Rect> = if merged.len() > 1 {
            merged.into_par_iter().filter_map(encode_one).collect()
        } else {
            merged.into_iter().filter_map(encode_one).collect()
        };

        FrameOut { rects, codec: CodecTag::Jpeg444, is_full_frame: false }
    }

    /// Merges horizontally-adjacent changed tiles in the same row into a single
    /// rectangle. Output order is row-major and deterministic.
    fn merge_row_runs(
        &self,
        changed: &[(u32, u32)],
        raster_width: u32,
        raster_height: u32,
    ) -> Vec<(u32, u32, u32, u32)> {
        let mut sorted = changed.to_vec();
        sorted.sort_unstable_by_key(|&(tx, ty)| (ty, tx));

        let mut out = Vec::new();
        let mut iter = sorted.into_iter().peekable();
        while let Some((tx, ty)) = iter.next() {
            let (x, y, mut w, h) = self.tile_rect(tx, ty, raster_width, raster_height);
            let mut last_tx = tx;
            while let Some(&(ntx, nty)) = iter.peek() {
                if nty == ty && ntx == last_tx + 1 {
                    let (nx, _ny, nw, _nh) = self.tile_rect(ntx, nty, raster_width, raster_height);
                    w = nx + nw - x;
                    last_tx = ntx;
                    iter.next();
                } else {
                    break;
                }
            }
            out.push((x, y, w, h));
        }
        out
    }
}

fn tile_bytes(raster: &RgbaRaster, x: u32, y: u32, w: u32, h: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(w as usize * h as usize * 4);
    for row in 0..h {
        let start = ((y + row) * raster.width + x) as usize * 4;
        out.extend_from_slice(&raster.data[start..start + w as usize * 4]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreResult;

    struct FakeCodec;
    impl Codec for FakeCodec {
        fn decode_png(&self, _data: &[u8], _rotation_degrees: u16) -> CoreResult<RgbaRaster> {
            unreachable!("not exercised by these tests")
        }
        fn encode_jpeg(&self, _raster: &RgbaRaster, _x: u32, _y: u32, w: u32, h: u32, _q: u8) -> CoreResult<Vec<u8>> {
            Ok(vec![0xFF; (w * h) as usize])
        }
    }

    fn raster(width: u32, height: u32, fill: u8) -> RgbaRaster {
        RgbaRaster::new(vec![fill; width as usize * height as usize * 4], width, height)
    }

    fn config() -> DeviceConfig {
        DeviceConfig {
            width: 64,
            height: 64,
            tile_size: 16,
            full_frame_tile_count: 1000,
            full_frame_area_threshold: 1.1,
            full_frame_every: 1000,
            ..DeviceConfig::default()
        }
    }

    #[test]
    fn first_frame_is_always_full() {
        let mut p = FrameProcessor::new(config(), Arc::new(FakeCodec));
        let out = p.process_frame(&raster(64, 64, 10));
        assert!(out.is_full_frame);
        assert_eq!(out.rects.len(), 1);
    }

    #[test]
    fn identical_second_frame_emits_no_change() {
        let mut p = FrameProcessor::new(config(), Arc::new(FakeCodec));
        p.process_frame(&raster(64, 64, 10));
        let out = p.process_frame(&raster(64, 64, 10));
        assert!(out.is_empty());
        assert!(!out.is_full_frame);
    }

    #[test]
    fn localized_change_emits_partial_rects() {
        let mut p = FrameProcessor::new(config(), Arc::new(FakeCodec));
        p.process_frame(&raster(64, 64, 10));

        let mut changed = raster(64, 64, 10);
        let mut data = changed.data.to_vec();
        for row in 0..16u32 {
            let start = (row * 64) as usize * 4;
            for px in data[start..start + 16 * 4].chunks_mut(4) {
                px[0] = 200;
            }
        }
        changed.data = data.into();

        let out = p.process_frame(&changed);
        assert!(!out.is_full_frame);
        assert!(!out.is_empty());
    }

    #[test]
    fn request_full_frame_forces_next_call() {
        let mut p = FrameProcessor::new(config(), Arc::new(FakeCodec));
        p.process_frame(&raster(64, 64, 10));
        p.request_full_frame();
        let out = p.process_frame(&raster(64, 64, 10));
        assert!(out.is_full_frame);
    }

    #[test]
    fn full_frame_every_one_forces_every_frame() {
        let mut cfg = config();
        cfg.full_frame_every = 1;
        let mut p = FrameProcessor::new(cfg, Arc::new(FakeCodec));
        p.process_frame(&raster(64, 64, 10));
        let out = p.process_frame(&raster(64, 64, 10));
        assert!(out.is_full_frame);
    }

    #[test]
    fn empty_rects_means_frame_id_should_not_advance() {
        // This processor-level test only checks the contract surface this
        // module promises; FrameId advancement itself lives in DeviceSession.
        let mut p = FrameProcessor::new(config(), Arc::new(FakeCodec));
        p.process_frame(&raster(64, 64, 10));
        let out = p.process_frame(&raster(64, 64, 10));
        assert!(out.is_empty());
    }
}
