//! The touch strip. Its image is its own state with every dial segment drawn on top.

use std::sync::Arc;

use image::RgbaImage;

use super::{ComposeRequest, ControllerInput};
use crate::actions::InputEvent;
use crate::controller::DeckController;
use crate::device::DeckEvent;
use crate::identifier::InputIdentifier;
use crate::render;

pub(crate) fn handle_event(input: &Arc<ControllerInput>, controller: &Arc<DeckController>, event: DeckEvent) {
    match event {
        DeckEvent::TouchDrag { start, end } => {
            let event = if end.0 < start.0 {
                InputEvent::DragLeft
            } else {
                InputEvent::DragRight
            };
            input.dispatch(controller, event);
        }
        DeckEvent::TouchShort { x, .. } | DeckEvent::TouchLong { x, .. } => {
            let Some(dial) = super::dial::dial_at(controller.deck(), x) else {
                return;
            };
            if let Some(dial_input) = controller.get_input(&InputIdentifier::Dial(dial)) {
                dial_input.event_callback(controller, event);
            }
        }
        other => log::debug!("Touchscreen ignores {other:?}"),
    }
}

/// The strip's own state, without dials.
fn render_base(input: &ControllerInput, controller: &DeckController) -> Option<RgbaImage> {
    let size = controller.deck().touchscreen_size()?;
    Some(input.get_active_state().compose(&ComposeRequest {
        size,
        tile: None,
        pressed: false,
        shrink_factor: 1.0,
        show_warning: !controller.screensaver().is_showing(),
        fonts: controller.fonts(),
    }))
}

pub(crate) fn render(input: &ControllerInput, controller: &DeckController) -> RgbaImage {
    let Some(mut strip) = render_base(input, controller) else {
        return RgbaImage::new(1, 1);
    };
    for dial in 0..controller.deck().dial_count() {
        let Some((x, _, _)) = super::dial::segment(controller.deck(), dial) else {
            continue;
        };
        if let Some(dial_input) = controller.get_input(&InputIdentifier::Dial(dial)) {
            let image = dial_input.get_current_image(controller);
            render::overlay_at(&mut strip, &image, i64::from(x), 0);
        }
    }
    strip
}

/// One dial's segment: the strip underneath with the dial image on top.
pub(crate) fn render_segment(input: &ControllerInput, controller: &DeckController, dial: u8) -> Option<(u32, RgbaImage)> {
    let (x, width, height) = super::dial::segment(controller.deck(), dial)?;
    let strip = render_base(input, controller)?;
    let mut segment = image::imageops::crop_imm(&strip, x, 0, width, height).to_image();
    if let Some(dial_input) = controller.get_input(&InputIdentifier::Dial(dial)) {
        render::overlay_at(&mut segment, &dial_input.get_current_image(controller), 0, 0);
    }
    Some((x, segment))
}
