use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::time::Duration;

use image::RgbaImage;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde_json::Value;

use super::managers::{BackgroundColorManager, LabelManager, LayoutConfig, LayoutManager};
use crate::actions::Action;
use crate::controller::DeckController;
use crate::identifier::InputIdentifier;
use crate::media::{ImageAsset, MediaRequest, MediaSlot, VideoAsset, load_media};
use crate::render::fonts::FontResolver;
use crate::render::label::{LabelPosition, draw_label};
use crate::render::layout::FillMode;
use crate::render::{self, solid};
use crate::scheduler::TimerToken;

/// A media reference and the playback options it was configured with.
#[derive(Debug, Clone, PartialEq)]
struct MediaSource {
    path: String,
    looped: bool,
    fps: Option<u32>,
}

impl MediaSource {
    fn from_media_block(media: &Value) -> Option<Self> {
        let path = media.get("path").and_then(Value::as_str)?.trim();
        if path.is_empty() {
            return None;
        }
        Some(Self {
            path: path.to_owned(),
            looped: media.get("loop").and_then(Value::as_bool).unwrap_or(true),
            fps: media
                .get("fps")
                .and_then(Value::as_u64)
                .map(|f| f.clamp(1, 240) as u32),
        })
    }
}

#[derive(Default)]
struct MediaSources {
    page: Option<MediaSource>,
    action: Option<MediaSource>,
    /// What is currently in the slot, with the box and fill it was fitted to.
    loaded: Option<(MediaSource, (u32, u32), FillMode)>,
}

/// Everything needed to composite one input image.
pub struct ComposeRequest<'a> {
    pub size: (u32, u32),
    /// Background tile under this input, loaded only when it can show through.
    pub tile: Option<&'a dyn Fn() -> Option<Arc<RgbaImage>>>,
    pub pressed: bool,
    pub shrink_factor: f32,
    pub show_warning: bool,
    pub fonts: &'a FontResolver,
}

/// One of the alternate configurations of an input.
pub struct ControllerInputState {
    state: AtomicU16,
    identifier: InputIdentifier,
    media: Mutex<MediaSlot>,
    sources: Mutex<MediaSources>,
    labels: Mutex<LabelManager>,
    layout: Mutex<LayoutManager>,
    background: Mutex<BackgroundColorManager>,
    overlay: Mutex<Option<(Arc<RgbaImage>, TimerToken)>>,
    overlay_generation: AtomicU64,
    actions: RwLock<Vec<Arc<dyn Action>>>,
}

impl ControllerInputState {
    pub fn new(identifier: InputIdentifier, state: u16, default_family: &str) -> Self {
        Self {
            state: AtomicU16::new(state),
            identifier,
            media: Mutex::new(MediaSlot::None),
            sources: Mutex::new(MediaSources::default()),
            labels: Mutex::new(LabelManager::new(default_family)),
            layout: Mutex::new(LayoutManager::default()),
            background: Mutex::new(BackgroundColorManager::default()),
            overlay: Mutex::new(None),
            overlay_generation: AtomicU64::new(0),
            actions: RwLock::new(Vec::new()),
        }
    }

    pub fn state(&self) -> u16 {
        self.state.load(Ordering::SeqCst)
    }

    pub(crate) fn renumber(&self, state: u16) {
        self.state.store(state, Ordering::SeqCst);
    }

    pub fn identifier(&self) -> &InputIdentifier {
        &self.identifier
    }

    pub fn label_manager(&self) -> &Mutex<LabelManager> {
        &self.labels
    }

    pub fn layout_manager(&self) -> &Mutex<LayoutManager> {
        &self.layout
    }

    pub fn background_manager(&self) -> &Mutex<BackgroundColorManager> {
        &self.background
    }

    pub fn media(&self) -> MutexGuard<'_, MediaSlot> {
        self.media.lock()
    }

    pub fn has_image(&self) -> bool {
        self.media.lock().image().is_some()
    }

    pub fn has_video(&self) -> bool {
        self.media.lock().video().is_some()
    }

    /// Show a still image; any video is dropped.
    pub fn set_image(&self, image: ImageAsset) {
        *self.media.lock() = MediaSlot::Image(image);
    }

    /// Play a video; any still image is dropped.
    pub fn set_video(&self, video: VideoAsset) {
        *self.media.lock() = MediaSlot::Video(video);
    }

    pub fn clear_media(&self) {
        *self.media.lock() = MediaSlot::None;
        self.sources.lock().loaded = None;
    }

    pub fn actions(&self) -> Vec<Arc<dyn Action>> {
        self.actions.read().clone()
    }

    pub fn set_actions(&self, actions: Vec<Arc<dyn Action>>) {
        *self.actions.write() = actions;
    }

    /// Any action on this state is missing its plugin or outdated.
    pub fn has_unavailable_actions(&self) -> bool {
        self.actions.read().iter().any(|a| a.health().is_unavailable())
    }

    /// Apply a state config snapshot from the page.
    pub fn load_from_config(&self, config: &Value, controller: &DeckController) {
        let media = config.get("media").cloned().unwrap_or(Value::Null);
        self.labels
            .lock()
            .load_page_labels(config.get("labels").unwrap_or(&Value::Null));
        self.layout.lock().set_page_layout(LayoutConfig::from_json(&media));
        self.background
            .lock()
            .load_page_background(config.get("background").unwrap_or(&Value::Null));
        self.sources.lock().page = MediaSource::from_media_block(&media);
        self.reload_media(controller);
    }

    /// Media chosen by an action; a page-configured media path still wins.
    pub fn set_action_media_path(&self, path: Option<&str>, controller: &DeckController) {
        self.sources.lock().action = path
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| MediaSource {
                path: p.to_owned(),
                looped: true,
                fps: None,
            });
        self.reload_media(controller);
    }

    /// Bring the media slot in line with the configured sources and layout.
    pub fn reload_media(&self, controller: &DeckController) {
        let layout = self.layout.lock().get_composed_layout();
        let target = layout.content_box(controller.input_image_size(&self.identifier));
        let wanted = {
            let sources = self.sources.lock();
            let wanted = sources.page.clone().or_else(|| sources.action.clone());
            if let (Some(wanted), Some((loaded, loaded_target, loaded_fill))) =
                (&wanted, &sources.loaded)
                && wanted == loaded
                && *loaded_target == target
                && *loaded_fill == layout.fill_mode
            {
                return;
            }
            wanted
        };

        let Some(source) = wanted else {
            self.clear_media();
            return;
        };
        let base_dirs: Vec<PathBuf> = controller.media_base_dirs();
        let videos_dir = controller.videos_dir();
        let request = MediaRequest {
            source: &source.path,
            base_dirs: &base_dirs,
            target,
            fill: layout.fill_mode,
            looped: source.looped,
            fps: source.fps,
            videos_dir: videos_dir.as_deref(),
        };
        let slot = match load_media(&request) {
            Ok(slot) => slot,
            Err(error) => {
                log::warn!(
                    "Failed to load media {} for {}: {error:#}",
                    source.path,
                    self.identifier
                );
                MediaSlot::None
            }
        };
        *self.media.lock() = slot;
        self.sources.lock().loaded = Some((source, target, layout.fill_mode));
    }

    /// Step the video forward if this tick is due. Returns whether the frame changed.
    pub fn advance_video(&self, tick: u64, loop_rate: u32) -> bool {
        let mut media = self.media.lock();
        match &mut *media {
            MediaSlot::Video(video) if video.is_due(tick, loop_rate) => video.advance(),
            _ => false,
        }
    }

    pub fn overlay(&self) -> Option<Arc<RgbaImage>> {
        self.overlay.lock().as_ref().map(|(image, _)| image.clone())
    }

    /// Show `image` over this state for `duration`, then re-render without it.
    pub fn show_overlay(
        self: &Arc<Self>,
        controller: &Arc<DeckController>,
        identifier: &InputIdentifier,
        image: RgbaImage,
        duration: Duration,
    ) {
        let generation = self.overlay_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak_state = Arc::downgrade(self);
        let weak_controller = Arc::downgrade(controller);
        let id = identifier.clone();
        let token = controller.scheduler().schedule(duration, move || {
            let (Some(state), Some(controller)) = (weak_state.upgrade(), weak_controller.upgrade())
            else {
                return;
            };
            if state.overlay_generation.load(Ordering::SeqCst) == generation {
                state.overlay.lock().take();
                controller.mark_dirty(&id);
            }
        });
        if let Some((_, previous)) = self.overlay.lock().replace((Arc::new(image), token)) {
            previous.cancel();
        }
        controller.mark_dirty(identifier);
    }

    pub fn clear_overlay(&self) {
        if let Some((_, token)) = self.overlay.lock().take() {
            token.cancel();
        }
    }

    /// Release media, overlay and actions. Called when the state is removed.
    pub fn close(&self) {
        self.clear_media();
        self.clear_overlay();
        self.actions.write().clear();
        self.labels.lock().clear_action_labels();
    }

    /// Composite this state: background color over the tile, overlay or media, labels,
    /// pressed shrink, then the unavailable-action marker.
    pub fn compose(&self, request: &ComposeRequest<'_>) -> RgbaImage {
        let (width, height) = request.size;
        let color = self.background.lock().get_composed_color();

        let mut canvas = if color[3] == u8::MAX {
            solid(width, height, color)
        } else {
            let mut base = request
                .tile
                .and_then(|tile| tile())
                .map(|tile| {
                    if tile.dimensions() == (width, height) {
                        (*tile).clone()
                    } else {
                        image::imageops::resize(
                            &*tile,
                            width,
                            height,
                            image::imageops::FilterType::Triangle,
                        )
                    }
                })
                .unwrap_or_else(|| RgbaImage::new(width, height));
            render::blend_color(&mut base, color);
            base
        };

        if let Some(overlay) = self.overlay() {
            render::apply_overlay(&mut canvas, &overlay);
            return canvas;
        }

        let layout = self.layout.lock().get_composed_layout();
        match &*self.media.lock() {
            MediaSlot::Image(image) => image.draw(&mut canvas, &layout),
            MediaSlot::Video(video) => {
                if let Some(frame) = video.current()
                    && let Some(image) = frame.first()
                {
                    layout.place(&mut canvas, image);
                }
            }
            MediaSlot::None => {}
        }

        {
            let labels = self.labels.lock();
            for position in LabelPosition::ALL {
                let label = labels.get_composed_label(position);
                draw_label(&mut canvas, &label, position, request.fonts);
            }
        }

        if request.pressed {
            canvas = render::shrink_centered(&canvas, request.shrink_factor);
        }
        if request.show_warning && self.has_unavailable_actions() {
            render::draw_warning_dot(&mut canvas);
        }
        canvas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::MissingAction;
    use crate::media::CacheTarget;
    use crate::media::VideoFrameCache;
    use crate::media::decoder::AnimatedImageDecoder;
    use crate::media::decoder::tests::write_test_gif;

    fn fonts() -> (tempfile::TempDir, FontResolver) {
        let dir = tempfile::tempdir().unwrap();
        let fonts = FontResolver::with_dirs(vec![dir.path().to_path_buf()], "Roboto");
        (dir, fonts)
    }

    fn request<'a>(fonts: &'a FontResolver) -> ComposeRequest<'a> {
        ComposeRequest {
            size: (72, 72),
            tile: None,
            pressed: false,
            shrink_factor: 0.7,
            show_warning: true,
            fonts,
        }
    }

    fn state() -> ControllerInputState {
        ControllerInputState::new(InputIdentifier::Key { x: 0, y: 0 }, 0, "Roboto")
    }

    fn video(dir: &std::path::Path) -> VideoAsset {
        let path = dir.join("clip.gif");
        write_test_gif(&path, 2);
        let decoder = AnimatedImageDecoder::open(&path).unwrap();
        let cache = VideoFrameCache::new(
            Box::new(decoder),
            CacheTarget::Single {
                width: 72,
                height: 72,
                fill: FillMode::Cover,
            },
            None,
        );
        VideoAsset::new(Arc::new(cache), &path, true, None)
    }

    #[test]
    fn image_and_video_are_mutually_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let state = state();
        state.set_image(ImageAsset::new(RgbaImage::new(4, 4), "a"));
        assert!(state.has_image() && !state.has_video());
        state.set_video(video(dir.path()));
        assert!(state.has_video() && !state.has_image());
        state.set_image(ImageAsset::new(RgbaImage::new(4, 4), "b"));
        assert!(state.has_image() && !state.has_video());
        state.clear_media();
        assert!(!state.has_image() && !state.has_video());
    }

    #[test]
    fn opaque_background_skips_the_tile() {
        let (_dir, fonts) = fonts();
        let state = state();
        state.background_manager().lock().set_page_color(Some([10, 20, 30, 255]));
        let loaded = std::cell::Cell::new(false);
        let tile = || {
            loaded.set(true);
            Some(Arc::new(solid(72, 72, [200, 0, 0, 255])))
        };
        let image = state.compose(&ComposeRequest {
            tile: Some(&tile),
            ..request(&fonts)
        });
        assert!(!loaded.get());
        assert!(image.pixels().all(|p| p.0 == [10, 20, 30, 255]));
    }

    #[test]
    fn translucent_background_blends_over_tile() {
        let (_dir, fonts) = fonts();
        let state = state();
        state.background_manager().lock().set_page_color(Some([0, 0, 255, 0]));
        let tile = || Some(Arc::new(solid(72, 72, [200, 0, 0, 255])));
        let image = state.compose(&ComposeRequest {
            tile: Some(&tile),
            ..request(&fonts)
        });
        assert_eq!(image.get_pixel(5, 5).0, [200, 0, 0, 255]);
    }

    #[test]
    fn overlay_short_circuits_media_and_labels() {
        let (_dir, fonts) = fonts();
        let state = Arc::new(state());
        state.set_image(ImageAsset::new(solid(72, 72, [1, 1, 1, 255]), "a"));
        state
            .label_manager()
            .lock()
            .set_action_text(LabelPosition::Top, Some("X".into()));
        *state.overlay.lock() = Some((Arc::new(solid(8, 8, [0, 255, 0, 255])), TimerToken::default()));
        let image = state.compose(&request(&fonts));
        assert_eq!(image.get_pixel(36, 36).0, [0, 255, 0, 255]);
        assert_eq!(image.get_pixel(2, 2).0[3], 0);
    }

    #[test]
    fn pressed_state_shrinks_and_warning_marks_missing_actions() {
        let (_dir, fonts) = fonts();
        let state = state();
        state.background_manager().lock().set_page_color(Some([10, 20, 30, 255]));
        state.set_actions(vec![Arc::new(MissingAction::new("gone"))]);

        let pressed = state.compose(&ComposeRequest {
            pressed: true,
            show_warning: false,
            ..request(&fonts)
        });
        assert_eq!(pressed.get_pixel(0, 0).0[3], 0);
        assert_eq!(pressed.get_pixel(36, 36).0, [10, 20, 30, 255]);

        let warned = state.compose(&request(&fonts));
        assert_ne!(warned.get_pixel(63, 9).0, [10, 20, 30, 255]);
        assert_eq!(warned.get_pixel(10, 60).0, [10, 20, 30, 255]);
    }

    #[test]
    fn close_releases_media_and_actions() {
        let state = state();
        state.set_image(ImageAsset::new(RgbaImage::new(2, 2), "a"));
        state.set_actions(vec![Arc::new(MissingAction::new("gone"))]);
        state.close();
        assert!(state.media().is_none());
        assert!(state.actions().is_empty());
    }
}
