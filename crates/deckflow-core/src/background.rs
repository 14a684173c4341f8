//! The deck-wide background, cut into one tile per key.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use image::RgbaImage;
use parking_lot::Mutex;

use crate::media::asset::{ImageAsset, VideoAsset, resolve_media_path};
use crate::media::decoder::is_animated_file;
use crate::media::frame_cache::{CacheTarget, VideoFrameCache, split_tiles};
use crate::store::BackgroundSettings;

enum Source {
    None,
    Image(ImageAsset),
    Video(VideoAsset),
}

/// Key grid geometry the tiles are cut for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub rows: u8,
    pub columns: u8,
    pub tile_width: u32,
    pub tile_height: u32,
}

impl TileGrid {
    pub fn key_count(&self) -> usize {
        usize::from(self.rows) * usize::from(self.columns)
    }
}

pub struct Background {
    grid: TileGrid,
    source: Mutex<Source>,
    /// Replaced wholesale; always `grid.key_count()` long.
    tiles: ArcSwap<Vec<Arc<RgbaImage>>>,
}

impl Background {
    pub fn new(grid: TileGrid) -> Self {
        Self {
            grid,
            source: Mutex::new(Source::None),
            tiles: ArcSwap::from_pointee(blank_tiles(&grid)),
        }
    }

    pub fn grid(&self) -> TileGrid {
        self.grid
    }

    pub fn tile(&self, key: u8) -> Option<Arc<RgbaImage>> {
        self.tiles.load().get(usize::from(key)).cloned()
    }

    pub fn tiles(&self) -> Arc<Vec<Arc<RgbaImage>>> {
        self.tiles.load_full()
    }

    pub fn is_video(&self) -> bool {
        matches!(*self.source.lock(), Source::Video(_))
    }

    pub fn clear(&self) {
        *self.source.lock() = Source::None;
        self.update_tiles();
    }

    pub fn set_image(&self, image: ImageAsset) {
        *self.source.lock() = Source::Image(image);
        self.update_tiles();
    }

    pub fn set_video(&self, video: VideoAsset) {
        *self.source.lock() = Source::Video(video);
        self.update_tiles();
    }

    /// Load the configured background. A missing or unreadable file leaves the deck blank.
    pub fn load(&self, settings: &BackgroundSettings, base_dirs: &[PathBuf], videos_dir: Option<&Path>) {
        let Some(raw) = settings.path.as_deref().filter(|_| settings.show) else {
            self.clear();
            return;
        };
        match self.open(raw, settings, base_dirs, videos_dir) {
            Ok(()) => {}
            Err(error) => {
                log::warn!("Failed to load background {raw}: {error:#}");
                self.clear();
            }
        }
    }

    fn open(
        &self,
        raw: &str,
        settings: &BackgroundSettings,
        base_dirs: &[PathBuf],
        videos_dir: Option<&Path>,
    ) -> anyhow::Result<()> {
        let path = resolve_media_path(raw, base_dirs)
            .ok_or_else(|| anyhow::anyhow!("background file not found"))?;
        if !is_animated_file(&path)? {
            self.set_image(ImageAsset::open(&path)?);
            return Ok(());
        }
        let target = CacheTarget::Tiles {
            rows: self.grid.rows,
            columns: self.grid.columns,
            tile_width: self.grid.tile_width,
            tile_height: self.grid.tile_height,
        };
        let cache = VideoFrameCache::open(&path, target, videos_dir)?;
        let fps = (settings.fps > 0).then_some(settings.fps);
        self.set_video(VideoAsset::new(Arc::new(cache), &path, settings.r#loop, fps));
        Ok(())
    }

    /// Advance a video background if due. Returns whether the tiles changed.
    pub fn advance(&self, tick: u64, loop_rate: u32) -> bool {
        let advanced = match &mut *self.source.lock() {
            Source::Video(video) if video.is_due(tick, loop_rate) => video.advance(),
            _ => false,
        };
        if advanced {
            self.update_tiles();
        }
        advanced
    }

    /// Recompute the tile array from the current source.
    pub fn update_tiles(&self) {
        let grid = self.grid;
        let tiles = match &*self.source.lock() {
            Source::None => blank_tiles(&grid),
            Source::Image(image) => split_tiles(
                image.image(),
                grid.rows,
                grid.columns,
                grid.tile_width,
                grid.tile_height,
            ),
            Source::Video(video) => video
                .current()
                .map(|frame| frame.as_ref().clone())
                .filter(|tiles| tiles.len() == grid.key_count())
                .unwrap_or_else(|| blank_tiles(&grid)),
        };
        self.tiles.store(Arc::new(tiles));
    }
}

fn blank_tiles(grid: &TileGrid) -> Vec<Arc<RgbaImage>> {
    let blank = Arc::new(RgbaImage::new(grid.tile_width.max(1), grid.tile_height.max(1)));
    vec![blank; grid.key_count()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::decoder::tests::write_test_gif;
    use image::Rgba;

    const GRID: TileGrid = TileGrid {
        rows: 3,
        columns: 5,
        tile_width: 72,
        tile_height: 72,
    };

    fn settings(path: &str) -> BackgroundSettings {
        BackgroundSettings {
            path: Some(path.to_owned()),
            r#loop: true,
            fps: 30,
            show: true,
        }
    }

    #[test]
    fn tiles_always_match_key_count() {
        let dir = tempfile::tempdir().unwrap();
        let background = Background::new(GRID);
        assert_eq!(background.tiles().len(), 15);

        let mut image = RgbaImage::new(360, 216);
        image.put_pixel(359, 215, Rgba([9, 9, 9, 255]));
        image.save(dir.path().join("wall.png")).unwrap();
        background.load(&settings("wall.png"), &[dir.path().to_path_buf()], None);
        assert_eq!(background.tiles().len(), 15);
        assert_eq!(background.tile(14).unwrap().get_pixel(71, 71).0, [9, 9, 9, 255]);

        write_test_gif(&dir.path().join("loop.gif"), 3);
        background.load(&settings("loop.gif"), &[dir.path().to_path_buf()], None);
        assert!(background.is_video());
        for tick in 0..10 {
            background.advance(tick, 30);
            assert_eq!(background.tiles().len(), 15);
        }

        background.load(&settings("missing.png"), &[dir.path().to_path_buf()], None);
        assert_eq!(background.tiles().len(), 15);
        assert!(!background.is_video());

        background.clear();
        assert_eq!(background.tiles().len(), 15);
        assert!(background.tile(15).is_none());
    }

    #[test]
    fn hidden_background_is_blank() {
        let background = Background::new(GRID);
        let mut hidden = settings("wall.png");
        hidden.show = false;
        background.load(&hidden, &[], None);
        assert_eq!(background.tile(0).unwrap().get_pixel(0, 0).0[3], 0);
    }
}
