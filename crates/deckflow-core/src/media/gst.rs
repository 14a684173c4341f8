//! GStreamer-backed decoding for real video containers.

use std::path::Path;

use anyhow::Context as _;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbaImage;

use super::decoder::VideoDecoder;

const DEFAULT_FPS: f32 = 30.0;
const PREROLL_TIMEOUT_SECS: u64 = 5;

pub struct GstDecoder {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    frame_count: usize,
    fps: f32,
    position: usize,
}

impl GstDecoder {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        gst::init().context("failed to initialise GStreamer")?;
        let location = path.to_string_lossy().replace('"', "\\\"");
        let description = format!(
            "filesrc location=\"{location}\" ! decodebin ! videoconvert ! \
             video/x-raw,format=RGBA ! appsink name=sink sync=false max-buffers=2"
        );
        let pipeline = gst::parse::launch(&description)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| anyhow::anyhow!("pipeline description did not produce a pipeline"))?;
        let appsink = pipeline
            .by_name("sink")
            .context("pipeline has no appsink")?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("element 'sink' is not an appsink"))?;

        pipeline.set_state(gst::State::Paused)?;
        let (result, _, _) = pipeline.state(gst::ClockTime::from_seconds(PREROLL_TIMEOUT_SECS));
        if let Err(error) = result {
            let _ = pipeline.set_state(gst::State::Null);
            anyhow::bail!("{} failed to preroll: {error}", path.display());
        }

        let fps = appsink
            .static_pad("sink")
            .and_then(|pad| pad.current_caps())
            .and_then(|caps| {
                caps.structure(0)
                    .and_then(|s| s.get::<gst::Fraction>("framerate").ok())
            })
            .filter(|rate| rate.numer() > 0 && rate.denom() > 0)
            .map(|rate| rate.numer() as f32 / rate.denom() as f32)
            .unwrap_or(DEFAULT_FPS);
        let duration = pipeline
            .query_duration::<gst::ClockTime>()
            .map(|d| d.seconds_f64())
            .unwrap_or(0.0);
        let frame_count = ((duration * f64::from(fps)).round() as usize).max(1);

        pipeline.set_state(gst::State::Playing)?;
        log::debug!(
            "Opened {} with GStreamer: {frame_count} frames at {fps:.2} fps",
            path.display()
        );
        Ok(Self {
            pipeline,
            appsink,
            frame_count,
            fps,
            position: 0,
        })
    }
}

impl VideoDecoder for GstDecoder {
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
        let nanos = (index as f64 / f64::from(self.fps) * 1e9) as u64;
        self.pipeline.seek_simple(
            gst::SeekFlags::FLUSH | gst::SeekFlags::ACCURATE,
            gst::ClockTime::from_nseconds(nanos),
        )?;
        self.position = index;
        Ok(())
    }

    fn next_frame(&mut self) -> anyhow::Result<Option<RgbaImage>> {
        if self.appsink.is_eos() {
            return Ok(None);
        }
        let Ok(sample) = self.appsink.pull_sample() else {
            return Ok(None);
        };
        let buffer = sample.buffer().context("sample without buffer")?;
        let caps = sample.caps().context("sample without caps")?;
        let info = gst_video::VideoInfo::from_caps(caps)?;
        let map = buffer.map_readable()?;
        let (width, height) = (info.width(), info.height());
        let stride = info.stride()[0] as usize;
        let row = width as usize * 4;
        let mut data = Vec::with_capacity(row * height as usize);
        for y in 0..height as usize {
            let start = y * stride;
            data.extend_from_slice(map.as_slice().get(start..start + row).context("short frame")?);
        }
        self.position += 1;
        Ok(RgbaImage::from_raw(width, height, data))
    }
}

impl Drop for GstDecoder {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
