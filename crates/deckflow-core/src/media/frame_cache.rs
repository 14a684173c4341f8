//! Decoded video frames, resized for their destination and cached by index.
//!
//! Frames are kept in memory and, when a disk root is given, persisted under
//! `<root>/<sha256>/<w>x<h>/<key>/<n>.rgba` so a restart does not decode again. Once every
//! frame is cached the decoder is dropped and the cache only serves from memory.

use std::collections::HashMap;
use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::Context as _;
use image::RgbaImage;
use image::imageops;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use super::decoder::{VideoDecoder, open_decoder};
use crate::render::layout::{FillMode, fit};

/// One decoded frame split into the parts its destination needs: a single image for an
/// input, or one tile per key for a deck background.
pub type CachedFrame = Arc<Vec<Arc<RgbaImage>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTarget {
    Single {
        width: u32,
        height: u32,
        fill: FillMode,
    },
    /// A full-deck image cut into `rows * columns` key tiles.
    Tiles {
        rows: u8,
        columns: u8,
        tile_width: u32,
        tile_height: u32,
    },
}

impl CacheTarget {
    pub fn parts(&self) -> usize {
        match self {
            CacheTarget::Single { .. } => 1,
            CacheTarget::Tiles { rows, columns, .. } => usize::from(*rows) * usize::from(*columns),
        }
    }

    fn part_size(&self) -> (u32, u32) {
        match *self {
            CacheTarget::Single { width, height, .. } => (width, height),
            CacheTarget::Tiles {
                tile_width,
                tile_height,
                ..
            } => (tile_width, tile_height),
        }
    }

    fn part_key(&self, part: usize) -> String {
        match self {
            CacheTarget::Single { fill, .. } => format!("{fill:?}").to_ascii_lowercase(),
            CacheTarget::Tiles { .. } => part.to_string(),
        }
    }

    pub fn transform(&self, frame: &RgbaImage) -> CachedFrame {
        match *self {
            CacheTarget::Single {
                width,
                height,
                fill,
            } => Arc::new(vec![Arc::new(fit(frame, (width, height), fill))]),
            CacheTarget::Tiles {
                rows,
                columns,
                tile_width,
                tile_height,
            } => Arc::new(split_tiles(frame, rows, columns, tile_width, tile_height)),
        }
    }
}

/// Cover-fit `image` to the whole key grid and cut it into row-major tiles.
pub fn split_tiles(
    image: &RgbaImage,
    rows: u8,
    columns: u8,
    tile_width: u32,
    tile_height: u32,
) -> Vec<Arc<RgbaImage>> {
    let full_w = tile_width * u32::from(columns);
    let full_h = tile_height * u32::from(rows);
    let full = fit(image, (full_w.max(1), full_h.max(1)), FillMode::Cover);
    let mut tiles = Vec::with_capacity(usize::from(rows) * usize::from(columns));
    for y in 0..u32::from(rows) {
        for x in 0..u32::from(columns) {
            let tile = imageops::crop_imm(&full, x * tile_width, y * tile_height, tile_width, tile_height);
            tiles.push(Arc::new(tile.to_image()));
        }
    }
    tiles
}

/// Hex SHA-256 of a file's contents.
pub fn file_digest(path: &Path) -> anyhow::Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    pub fn new(videos_dir: &Path, digest: &str) -> Self {
        Self {
            root: videos_dir.join(digest),
        }
    }

    fn frame_path(&self, target: &CacheTarget, part: usize, index: usize) -> PathBuf {
        let (w, h) = target.part_size();
        self.root
            .join(format!("{w}x{h}"))
            .join(target.part_key(part))
            .join(format!("{index}.rgba"))
    }

    fn load(&self, target: &CacheTarget, index: usize) -> Option<CachedFrame> {
        let mut parts = Vec::with_capacity(target.parts());
        for part in 0..target.parts() {
            let bytes = std::fs::read(self.frame_path(target, part, index)).ok()?;
            parts.push(Arc::new(decode_raw(&bytes)?));
        }
        Some(Arc::new(parts))
    }

    fn store(&self, target: &CacheTarget, index: usize, frame: &CachedFrame) {
        for (part, image) in frame.iter().enumerate() {
            let path = self.frame_path(target, part, index);
            let result = path
                .parent()
                .map(std::fs::create_dir_all)
                .unwrap_or(Ok(()))
                .and_then(|_| std::fs::write(&path, encode_raw(image)));
            if let Err(error) = result {
                log::debug!("Failed to persist frame {}: {error}", path.display());
                return;
            }
        }
    }
}

fn encode_raw(image: &RgbaImage) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + image.as_raw().len());
    out.extend_from_slice(&image.width().to_le_bytes());
    out.extend_from_slice(&image.height().to_le_bytes());
    out.extend_from_slice(image.as_raw());
    out
}

fn decode_raw(bytes: &[u8]) -> Option<RgbaImage> {
    let width = u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?);
    let height = u32::from_le_bytes(bytes.get(4..8)?.try_into().ok()?);
    RgbaImage::from_raw(width, height, bytes.get(8..)?.to_vec())
}

struct CacheState {
    decoder: Option<Box<dyn VideoDecoder>>,
    frames: HashMap<usize, CachedFrame>,
}

pub struct VideoFrameCache {
    state: Mutex<CacheState>,
    n_frames: usize,
    fps: f32,
    target: CacheTarget,
    disk: Option<DiskCache>,
    complete: AtomicBool,
    releases: AtomicUsize,
}

impl VideoFrameCache {
    /// Open `path` for `target`. With `videos_dir` set, frames persist on disk.
    pub fn open(path: &Path, target: CacheTarget, videos_dir: Option<&Path>) -> anyhow::Result<Self> {
        let decoder = open_decoder(path)?;
        let disk = match videos_dir {
            Some(dir) => Some(DiskCache::new(dir, &file_digest(path)?)),
            None => None,
        };
        Ok(Self::new(decoder, target, disk))
    }

    pub fn new(decoder: Box<dyn VideoDecoder>, target: CacheTarget, disk: Option<DiskCache>) -> Self {
        let n_frames = decoder.frame_count().max(1);
        let fps = decoder.fps();
        Self {
            state: Mutex::new(CacheState {
                decoder: Some(decoder),
                frames: HashMap::new(),
            }),
            n_frames,
            fps,
            target,
            disk,
            complete: AtomicBool::new(false),
            releases: AtomicUsize::new(0),
        }
    }

    pub fn frame_count(&self) -> usize {
        self.n_frames
    }

    pub fn fps(&self) -> f32 {
        self.fps
    }

    pub fn target(&self) -> CacheTarget {
        self.target
    }

    /// Every frame is in memory and the decoder has been dropped.
    pub fn is_cache_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// Times the decoder was dropped; never more than one.
    pub fn decoder_releases(&self) -> usize {
        self.releases.load(Ordering::Acquire)
    }

    /// Frame `n`, clamped to the last frame. `None` only when nothing could be decoded.
    pub fn get_frame(&self, n: usize) -> Option<CachedFrame> {
        let n = n.min(self.n_frames - 1);
        let mut state = self.state.lock();
        if let Some(frame) = state.frames.get(&n) {
            return Some(frame.clone());
        }

        if let Some(disk) = &self.disk
            && let Some(frame) = disk.load(&self.target, n)
        {
            state.frames.insert(n, frame.clone());
            self.release_if_complete(&mut state);
            return Some(frame);
        }

        self.decode_until(&mut state, n);
        let found = state
            .frames
            .get(&n)
            .cloned()
            // A stream shorter than advertised: show the newest frame before `n`.
            .or_else(|| (0..n).rev().find_map(|i| state.frames.get(&i).cloned()));
        self.release_if_complete(&mut state);
        found
    }

    fn decode_until(&self, state: &mut CacheState, n: usize) {
        let CacheState { decoder, frames } = state;
        let Some(decoder) = decoder.as_mut() else {
            return;
        };
        if n < decoder.position()
            && let Err(error) = decoder.seek(n)
        {
            log::warn!("Seeking to frame {n} failed: {error:#}");
            return;
        }
        while decoder.position() <= n {
            let index = decoder.position();
            let frame = match decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(error) => {
                    log::warn!("Decoding frame {index} failed: {error:#}");
                    break;
                }
            };
            if frames.contains_key(&index) {
                continue;
            }
            let frame = self.target.transform(&frame);
            if let Some(disk) = &self.disk {
                disk.store(&self.target, index, &frame);
            }
            frames.insert(index, frame);
        }
    }

    fn release_if_complete(&self, state: &mut CacheState) {
        if state.frames.len() >= self.n_frames && state.decoder.take().is_some() {
            self.complete.store(true, Ordering::Release);
            self.releases.fetch_add(1, Ordering::AcqRel);
            log::debug!("All {} frames cached; released decoder", self.n_frames);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::decoder::tests::{frame_number, write_test_gif};
    use image::Rgba;
    use std::sync::atomic::AtomicUsize;

    struct CountingDecoder {
        frames: usize,
        position: usize,
        decoded: Arc<AtomicUsize>,
        seeks: Arc<AtomicUsize>,
        dropped: Arc<AtomicUsize>,
    }

    impl VideoDecoder for CountingDecoder {
        fn frame_count(&self) -> usize {
            self.frames
        }
        fn fps(&self) -> f32 {
            10.0
        }
        fn position(&self) -> usize {
            self.position
        }
        fn seek(&mut self, index: usize) -> anyhow::Result<()> {
            self.seeks.fetch_add(1, Ordering::SeqCst);
            self.position = index;
            Ok(())
        }
        fn next_frame(&mut self) -> anyhow::Result<Option<RgbaImage>> {
            if self.position >= self.frames {
                return Ok(None);
            }
            self.decoded.fetch_add(1, Ordering::SeqCst);
            let value = (self.position * 40) as u8;
            self.position += 1;
            Ok(Some(RgbaImage::from_pixel(16, 16, Rgba([value, 0, 0, 255]))))
        }
    }

    impl Drop for CountingDecoder {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Counters {
        decoded: Arc<AtomicUsize>,
        seeks: Arc<AtomicUsize>,
        dropped: Arc<AtomicUsize>,
    }

    fn counting(frames: usize) -> (Box<dyn VideoDecoder>, Counters) {
        let counters = Counters {
            decoded: Arc::default(),
            seeks: Arc::default(),
            dropped: Arc::default(),
        };
        let decoder = CountingDecoder {
            frames,
            position: 0,
            decoded: counters.decoded.clone(),
            seeks: counters.seeks.clone(),
            dropped: counters.dropped.clone(),
        };
        (Box::new(decoder), counters)
    }

    const SINGLE: CacheTarget = CacheTarget::Single {
        width: 8,
        height: 8,
        fill: FillMode::Stretch,
    };

    #[test]
    fn decodes_sequentially_without_seeking() {
        let (decoder, counters) = counting(5);
        let cache = VideoFrameCache::new(decoder, SINGLE, None);
        let third = cache.get_frame(2).unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].dimensions(), (8, 8));
        assert_eq!(frame_number(&third[0]), 2);
        assert_eq!(counters.decoded.load(Ordering::SeqCst), 3);
        assert_eq!(counters.seeks.load(Ordering::SeqCst), 0);

        cache.get_frame(1).unwrap();
        assert_eq!(counters.decoded.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn releases_decoder_exactly_once_when_complete() {
        let (decoder, counters) = counting(4);
        let cache = VideoFrameCache::new(decoder, SINGLE, None);
        for n in 0..4 {
            cache.get_frame(n).unwrap();
        }
        assert!(cache.is_cache_complete());
        assert_eq!(cache.decoder_releases(), 1);
        assert_eq!(counters.dropped.load(Ordering::SeqCst), 1);

        for _ in 0..3 {
            for n in (0..4).rev() {
                assert_eq!(frame_number(&cache.get_frame(n).unwrap()[0]), n);
            }
        }
        assert_eq!(counters.decoded.load(Ordering::SeqCst), 4);
        assert_eq!(cache.decoder_releases(), 1);
        assert!(cache.is_cache_complete());
    }

    #[test]
    fn out_of_range_requests_clamp_to_last_frame() {
        let (decoder, _counters) = counting(3);
        let cache = VideoFrameCache::new(decoder, SINGLE, None);
        assert_eq!(frame_number(&cache.get_frame(99).unwrap()[0]), 2);
        assert!(cache.is_cache_complete());
    }

    #[test]
    fn tiles_cover_every_key() {
        let (decoder, _counters) = counting(1);
        let target = CacheTarget::Tiles {
            rows: 3,
            columns: 5,
            tile_width: 10,
            tile_height: 10,
        };
        let cache = VideoFrameCache::new(decoder, target, None);
        let frame = cache.get_frame(0).unwrap();
        assert_eq!(frame.len(), 15);
        assert!(frame.iter().all(|tile| tile.dimensions() == (10, 10)));
    }

    #[test]
    fn disk_cache_serves_a_fresh_cache_without_decoding() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("clip.gif");
        write_test_gif(&source, 3);
        let videos = dir.path().join("videos");

        let first = VideoFrameCache::open(&source, SINGLE, Some(&videos)).unwrap();
        for n in 0..3 {
            first.get_frame(n).unwrap();
        }
        let digest = file_digest(&source).unwrap();
        assert!(videos.join(&digest).join("8x8").join("stretch").join("2.rgba").is_file());

        let (decoder, counters) = counting(3);
        let second = VideoFrameCache::new(decoder, SINGLE, Some(DiskCache::new(&videos, &digest)));
        for n in 0..3 {
            assert_eq!(frame_number(&second.get_frame(n).unwrap()[0]), n);
        }
        assert_eq!(counters.decoded.load(Ordering::SeqCst), 0);
        assert!(second.is_cache_complete());
    }
}
