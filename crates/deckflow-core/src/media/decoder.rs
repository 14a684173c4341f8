//! Sequential frame decoders.
//!
//! Animated GIF, WebP and APNG files decode through `image`. The animation iterators it
//! hands out are not `Send`, so each decoder owns a small thread that walks the iterator
//! and passes frames over a bounded channel. Seeking backward restarts that thread.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context as _;
use crossbeam::channel::{Receiver, bounded};
use image::codecs::gif::GifDecoder;
use image::codecs::png::PngDecoder;
use image::codecs::webp::WebPDecoder;
use image::{AnimationDecoder as _, ImageFormat, RgbaImage};

/// Clamp for per-frame delays; tiny GIF delays are a common authoring artifact.
const MIN_FRAME_DELAY: Duration = Duration::from_millis(33);
const MAX_FRAME_DELAY: Duration = Duration::from_secs(2);
/// Bound on frames read from a single animation.
pub const MAX_FRAMES: usize = 3000;

pub trait VideoDecoder: Send {
    fn frame_count(&self) -> usize;
    fn fps(&self) -> f32;
    /// Index of the frame the next call to [`VideoDecoder::next_frame`] returns.
    fn position(&self) -> usize;
    /// Reposition so the next decoded frame is `index`.
    fn seek(&mut self, index: usize) -> anyhow::Result<()>;
    /// `None` once the stream is exhausted.
    fn next_frame(&mut self) -> anyhow::Result<Option<RgbaImage>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AnimationKind {
    Gif,
    WebP,
    Apng,
    Still,
}

fn detect_kind(path: &Path) -> anyhow::Result<AnimationKind> {
    let reader = image::ImageReader::open(path)?.with_guessed_format()?;
    Ok(match reader.format() {
        Some(ImageFormat::Gif) => AnimationKind::Gif,
        Some(ImageFormat::WebP) => AnimationKind::WebP,
        Some(ImageFormat::Png) => {
            let decoder = PngDecoder::new(BufReader::new(File::open(path)?))?;
            if decoder.is_apng()? {
                AnimationKind::Apng
            } else {
                AnimationKind::Still
            }
        }
        _ => AnimationKind::Still,
    })
}

type FrameIter = Box<dyn Iterator<Item = anyhow::Result<(RgbaImage, Duration)>>>;

fn open_frames(path: &Path, kind: AnimationKind) -> anyhow::Result<FrameIter> {
    let reader = BufReader::new(File::open(path)?);
    let frames = match kind {
        AnimationKind::Gif => GifDecoder::new(reader)?.into_frames(),
        AnimationKind::WebP => WebPDecoder::new(reader)?.into_frames(),
        AnimationKind::Apng => PngDecoder::new(reader)?.apng()?.into_frames(),
        AnimationKind::Still => {
            let image = image::open(path)?.to_rgba8();
            return Ok(Box::new(std::iter::once(Ok((image, MIN_FRAME_DELAY)))));
        }
    };
    Ok(Box::new(frames.take(MAX_FRAMES).map(|frame| {
        let frame = frame?;
        let delay = frame_delay(frame.delay());
        Ok((frame.into_buffer(), delay))
    })))
}

fn frame_delay(delay: image::Delay) -> Duration {
    let (num, den) = delay.numer_denom_ms();
    let delay = if den == 0 {
        MIN_FRAME_DELAY
    } else {
        Duration::from_millis((u64::from(num).saturating_add(u64::from(den) / 2)) / u64::from(den))
    };
    delay.clamp(MIN_FRAME_DELAY, MAX_FRAME_DELAY)
}

struct FrameStream {
    frames: Receiver<anyhow::Result<RgbaImage>>,
    _thread: JoinHandle<()>,
}

impl FrameStream {
    fn start(path: PathBuf, kind: AnimationKind, skip: usize) -> anyhow::Result<Self> {
        let (sender, frames) = bounded(2);
        let thread = std::thread::Builder::new()
            .name("frame-decoder".to_owned())
            .spawn(move || {
                let iter = match open_frames(&path, kind) {
                    Ok(iter) => iter,
                    Err(error) => {
                        let _ = sender.send(Err(error));
                        return;
                    }
                };
                for frame in iter.skip(skip) {
                    // The receiver hung up: the decoder was released or restarted.
                    if sender.send(frame.map(|(image, _)| image)).is_err() {
                        return;
                    }
                }
            })
            .context("failed to spawn frame decoder thread")?;
        Ok(Self {
            frames,
            _thread: thread,
        })
    }
}

/// Whether `path` holds more than one frame. Reads at most two frames.
pub fn is_animated_file(path: &Path) -> anyhow::Result<bool> {
    if is_video_container(path) {
        return Ok(true);
    }
    let kind = detect_kind(path)
        .with_context(|| format!("unsupported media file {}", path.display()))?;
    if kind == AnimationKind::Still {
        return Ok(false);
    }
    let frames = open_frames(path, kind)?
        .take(2)
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(frames.len() > 1)
}

#[cfg(test)]
thread_local! {
    /// Full frame-counting passes made by [`AnimatedImageDecoder::open`] on this thread.
    pub(crate) static COUNTING_PASSES: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

/// Decoder for anything `image` can read, animated or not.
pub struct AnimatedImageDecoder {
    path: PathBuf,
    kind: AnimationKind,
    frame_count: usize,
    fps: f32,
    position: usize,
    stream: Option<FrameStream>,
}

impl AnimatedImageDecoder {
    /// Opens `path` and counts its frames up front.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let kind = detect_kind(path)
            .with_context(|| format!("unsupported media file {}", path.display()))?;
        #[cfg(test)]
        COUNTING_PASSES.with(|passes| passes.set(passes.get() + 1));
        let mut frame_count = 0usize;
        let mut first_delay = None;
        for frame in open_frames(path, kind)? {
            let (_, delay) = frame?;
            first_delay.get_or_insert(delay);
            frame_count += 1;
        }
        if frame_count == 0 {
            anyhow::bail!("{} has no frames", path.display());
        }
        let fps = 1.0 / first_delay.unwrap_or(MIN_FRAME_DELAY).as_secs_f32();
        Ok(Self {
            path: path.to_path_buf(),
            kind,
            frame_count,
            fps,
            position: 0,
            stream: None,
        })
    }

    pub fn is_animated(&self) -> bool {
        self.frame_count > 1
    }
}

impl VideoDecoder for AnimatedImageDecoder {
    fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn fps(&self) -> f32 {
        self.fps
    }

    fn position(&self) -> usize {
        self.position
    }

    fn seek(&mut self, index: usize) -> anyhow::Result<()> {
        if index == self.position && self.stream.is_some() {
            return Ok(());
        }
        self.stream = Some(FrameStream::start(self.path.clone(), self.kind, index)?);
        self.position = index;
        Ok(())
    }

    fn next_frame(&mut self) -> anyhow::Result<Option<RgbaImage>> {
        if self.position >= self.frame_count {
            return Ok(None);
        }
        if self.stream.is_none() {
            self.stream = Some(FrameStream::start(self.path.clone(), self.kind, self.position)?);
        }
        let Some(stream) = &self.stream else {
            return Ok(None);
        };
        match stream.frames.recv() {
            Ok(frame) => {
                self.position += 1;
                frame.map(Some)
            }
            Err(_) => Ok(None),
        }
    }
}

/// Extensions routed to the GStreamer decoder when that feature is on.
pub fn is_video_container(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            matches!(
                e.to_ascii_lowercase().as_str(),
                "mp4" | "mkv" | "webm" | "mov" | "avi" | "m4v"
            )
        })
        .unwrap_or(false)
}

/// Open the best decoder for `path`.
pub fn open_decoder(path: &Path) -> anyhow::Result<Box<dyn VideoDecoder>> {
    if is_video_container(path) {
        #[cfg(feature = "gstreamer")]
        {
            return Ok(Box::new(super::gst::GstDecoder::open(path)?));
        }
        #[cfg(not(feature = "gstreamer"))]
        anyhow::bail!("{} needs the gstreamer feature to play", path.display());
    }
    Ok(Box::new(AnimatedImageDecoder::open(path)?))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::codecs::gif::GifEncoder;
    use image::{Delay, Frame, Rgba};

    /// Write an animated GIF whose frame `n` is filled with red `n * 40`.
    pub(crate) fn write_test_gif(path: &Path, frames: usize) {
        let file = File::create(path).unwrap();
        let mut encoder = GifEncoder::new(file);
        for n in 0..frames {
            let image = RgbaImage::from_pixel(8, 8, Rgba([(n * 40) as u8, 0, 0, 255]));
            let frame = Frame::from_parts(image, 0, 0, Delay::from_numer_denom_ms(100, 1));
            encoder.encode_frame(frame).unwrap();
        }
    }

    /// Frame number encoded by [`write_test_gif`].
    pub(crate) fn frame_number(image: &RgbaImage) -> usize {
        ((f32::from(image.get_pixel(0, 0).0[0]) / 40.0).round()) as usize
    }

    #[test]
    fn decodes_gif_frames_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anim.gif");
        write_test_gif(&path, 4);

        let mut decoder = AnimatedImageDecoder::open(&path).unwrap();
        assert_eq!(decoder.frame_count(), 4);
        assert!(decoder.is_animated());
        assert!((decoder.fps() - 10.0).abs() < 0.5);

        let first = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame_number(&first), 0);
        let second = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame_number(&second), 1);

        decoder.seek(0).unwrap();
        assert_eq!(decoder.position(), 0);
        assert_eq!(frame_number(&decoder.next_frame().unwrap().unwrap()), 0);

        decoder.seek(3).unwrap();
        assert_eq!(frame_number(&decoder.next_frame().unwrap().unwrap()), 3);
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn animation_sniffing_reads_few_frames() {
        let dir = tempfile::tempdir().unwrap();
        let animated = dir.path().join("anim.gif");
        write_test_gif(&animated, 4);
        let single = dir.path().join("single.gif");
        write_test_gif(&single, 1);
        let still = dir.path().join("still.png");
        RgbaImage::from_pixel(4, 4, Rgba([1, 2, 3, 255])).save(&still).unwrap();

        let before = COUNTING_PASSES.with(|p| p.get());
        assert!(is_animated_file(&animated).unwrap());
        assert!(!is_animated_file(&single).unwrap());
        assert!(!is_animated_file(&still).unwrap());
        assert!(is_animated_file(Path::new("clip.mp4")).unwrap());
        assert_eq!(COUNTING_PASSES.with(|p| p.get()), before);
    }

    #[test]
    fn still_images_have_one_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("still.png");
        RgbaImage::from_pixel(4, 4, Rgba([1, 2, 3, 255])).save(&path).unwrap();
        let decoder = AnimatedImageDecoder::open(&path).unwrap();
        assert_eq!(decoder.frame_count(), 1);
        assert!(!decoder.is_animated());
    }
}
