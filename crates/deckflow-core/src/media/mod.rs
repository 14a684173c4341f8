//! Images and videos shown on inputs and deck backgrounds.

pub mod asset;
pub mod decoder;
pub mod frame_cache;
#[cfg(feature = "gstreamer")]
pub mod gst;

pub use asset::{ImageAsset, MediaRequest, MediaSlot, VideoAsset, load_media};
pub use decoder::{AnimatedImageDecoder, VideoDecoder, open_decoder};
pub use frame_cache::{CacheTarget, CachedFrame, VideoFrameCache};
