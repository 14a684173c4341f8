use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use base64::Engine as _;
use image::RgbaImage;
use parking_lot::Mutex;

use super::decoder::is_animated_file;
use super::frame_cache::{CacheTarget, CachedFrame, VideoFrameCache};
use crate::render::layout::{FillMode, Layout, fit};

/// Resolve a media reference from a page. Relative paths are tried against `base_dirs`.
pub fn resolve_media_path(raw: &str, base_dirs: &[PathBuf]) -> Option<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with("data:") {
        return None;
    }
    let path = Path::new(raw);
    if path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }
    if path.is_file() {
        return Some(path.to_path_buf());
    }
    base_dirs
        .iter()
        .map(|dir| dir.join(path))
        .find(|candidate| candidate.is_file())
}

/// Decode a `data:` URL, base64 or raw.
pub fn decode_data_url(url: &str) -> anyhow::Result<RgbaImage> {
    let bytes = if url.contains(";base64,") {
        let (_meta, b64) = url
            .split_once(";base64,")
            .ok_or_else(|| anyhow::anyhow!("invalid data url (missing ';base64,')"))?;
        base64::engine::general_purpose::STANDARD.decode(b64.trim())?
    } else {
        let (_meta, raw) = url
            .split_once(',')
            .ok_or_else(|| anyhow::anyhow!("invalid data url (missing ',')"))?;
        raw.as_bytes().to_vec()
    };
    Ok(image::load_from_memory(&bytes)?.to_rgba8())
}

type FittedKey = ((u32, u32), FillMode);

pub struct ImageAsset {
    image: Arc<RgbaImage>,
    source: String,
    fitted: Mutex<Option<(FittedKey, Arc<RgbaImage>)>>,
}

impl ImageAsset {
    pub fn new(image: RgbaImage, source: impl Into<String>) -> Self {
        Self {
            image: Arc::new(image),
            source: source.into(),
            fitted: Mutex::new(None),
        }
    }

    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let image = image::open(path)
            .with_context(|| format!("failed to load image {}", path.display()))?
            .to_rgba8();
        Ok(Self::new(image, path.to_string_lossy()))
    }

    pub fn image(&self) -> &Arc<RgbaImage> {
        &self.image
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Composite onto `canvas` per `layout`, reusing the last resize when the box is unchanged.
    pub fn draw(&self, canvas: &mut RgbaImage, layout: &Layout) {
        let target = layout.content_box(canvas.dimensions());
        let key = (target, layout.fill_mode);
        let fitted = {
            let mut cached = self.fitted.lock();
            match cached.as_ref() {
                Some((k, image)) if *k == key => image.clone(),
                _ => {
                    let image = Arc::new(fit(&self.image, target, layout.fill_mode));
                    *cached = Some((key, image.clone()));
                    image
                }
            }
        };
        let (x, y) = layout.offset(canvas.dimensions(), fitted.dimensions());
        crate::render::overlay_at(canvas, &fitted, x, y);
    }
}

pub struct VideoAsset {
    cache: Arc<VideoFrameCache>,
    path: PathBuf,
    looped: bool,
    fps: u32,
    frame: usize,
}

impl VideoAsset {
    /// `fps` overrides the file's own frame rate.
    pub fn new(cache: Arc<VideoFrameCache>, path: &Path, looped: bool, fps: Option<u32>) -> Self {
        let fps = fps
            .filter(|f| *f > 0)
            .unwrap_or_else(|| (cache.fps().round() as u32).max(1));
        Self {
            cache,
            path: path.to_path_buf(),
            looped,
            fps,
            frame: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cache(&self) -> &Arc<VideoFrameCache> {
        &self.cache
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn frame_index(&self) -> usize {
        self.frame
    }

    /// Render ticks between frames when the render loop runs at `loop_rate`.
    pub fn ticks_per_frame(&self, loop_rate: u32) -> u64 {
        u64::from((loop_rate / self.fps.max(1)).max(1))
    }

    pub fn is_due(&self, tick: u64, loop_rate: u32) -> bool {
        tick % self.ticks_per_frame(loop_rate) == 0
    }

    /// Move to the next frame. Returns `false` when a non-looping video sits on its last frame.
    pub fn advance(&mut self) -> bool {
        let count = self.cache.frame_count();
        if self.frame + 1 < count {
            self.frame += 1;
            true
        } else if self.looped && count > 1 {
            self.frame = 0;
            true
        } else {
            false
        }
    }

    pub fn current(&self) -> Option<CachedFrame> {
        self.cache.get_frame(self.frame)
    }
}

/// What an input state displays as its media. Setting one kind replaces the other.
#[derive(Default)]
pub enum MediaSlot {
    #[default]
    None,
    Image(ImageAsset),
    Video(VideoAsset),
}

impl MediaSlot {
    pub fn is_none(&self) -> bool {
        matches!(self, MediaSlot::None)
    }

    pub fn image(&self) -> Option<&ImageAsset> {
        match self {
            MediaSlot::Image(image) => Some(image),
            _ => None,
        }
    }

    pub fn video(&self) -> Option<&VideoAsset> {
        match self {
            MediaSlot::Video(video) => Some(video),
            _ => None,
        }
    }
}

/// Settings for turning a media reference into a [`MediaSlot`].
pub struct MediaRequest<'a> {
    pub source: &'a str,
    pub base_dirs: &'a [PathBuf],
    /// Size of the media box the frames are fitted to.
    pub target: (u32, u32),
    pub fill: FillMode,
    pub looped: bool,
    pub fps: Option<u32>,
    /// Where frames persist; `None` keeps them in memory only.
    pub videos_dir: Option<&'a Path>,
}

/// Load a page media reference. Animated files become videos, everything else an image.
pub fn load_media(request: &MediaRequest<'_>) -> anyhow::Result<MediaSlot> {
    let source = request.source.trim();
    if source.starts_with("data:") {
        return Ok(MediaSlot::Image(ImageAsset::new(decode_data_url(source)?, "data-url")));
    }
    let path = resolve_media_path(source, request.base_dirs)
        .ok_or_else(|| anyhow::anyhow!("media file not found: {source}"))?;

    if !is_animated_file(&path)? {
        return Ok(MediaSlot::Image(ImageAsset::open(&path)?));
    }

    let target = CacheTarget::Single {
        width: request.target.0,
        height: request.target.1,
        fill: request.fill,
    };
    let cache = VideoFrameCache::open(&path, target, request.videos_dir)?;
    Ok(MediaSlot::Video(VideoAsset::new(
        Arc::new(cache),
        &path,
        request.looped,
        request.fps,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::decoder::tests::write_test_gif;
    use image::Rgba;

    const PIXEL_PNG: &str = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVQIW2NgYGD4DwABBAEAwS2OUAAAAABJRU5ErkJggg==";

    fn request<'a>(source: &'a str, base_dirs: &'a [PathBuf]) -> MediaRequest<'a> {
        MediaRequest {
            source,
            base_dirs,
            target: (72, 72),
            fill: FillMode::Cover,
            looped: true,
            fps: None,
            videos_dir: None,
        }
    }

    #[test]
    fn data_urls_load_as_images() {
        let slot = load_media(&request(PIXEL_PNG, &[])).unwrap();
        let image = slot.image().unwrap();
        assert_eq!(image.image().dimensions(), (1, 1));
    }

    #[test]
    fn relative_paths_resolve_against_base_dirs() {
        let dir = tempfile::tempdir().unwrap();
        RgbaImage::from_pixel(4, 4, Rgba([1, 2, 3, 255]))
            .save(dir.path().join("icon.png"))
            .unwrap();
        let bases = vec![dir.path().to_path_buf()];
        assert!(load_media(&request("icon.png", &bases)).unwrap().image().is_some());
        assert!(load_media(&request("missing.png", &bases)).is_err());
    }

    #[test]
    fn animated_gifs_become_videos_that_loop() {
        let dir = tempfile::tempdir().unwrap();
        write_test_gif(&dir.path().join("spin.gif"), 3);
        let bases = vec![dir.path().to_path_buf()];
        let passes = || crate::media::decoder::COUNTING_PASSES.with(|p| p.get());
        let before = passes();
        let slot = load_media(&request("spin.gif", &bases)).unwrap();
        assert_eq!(passes() - before, 1);
        let MediaSlot::Video(mut video) = slot else {
            panic!("expected a video");
        };
        assert_eq!(video.fps(), 10);
        assert_eq!(video.ticks_per_frame(30), 3);
        assert!(video.advance());
        assert!(video.advance());
        assert!(video.advance());
        assert_eq!(video.frame_index(), 0);
        assert_eq!(video.current().unwrap()[0].dimensions(), (72, 72));
    }

    #[test]
    fn draw_applies_layout() {
        let asset = ImageAsset::new(RgbaImage::from_pixel(10, 10, Rgba([5, 5, 5, 255])), "t");
        let mut canvas = RgbaImage::new(72, 72);
        let layout = Layout {
            size: 0.5,
            ..Layout::default()
        };
        asset.draw(&mut canvas, &layout);
        assert_eq!(canvas.get_pixel(36, 36).0, [5, 5, 5, 255]);
        assert_eq!(canvas.get_pixel(2, 2).0[3], 0);
    }
}
