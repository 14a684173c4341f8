//! Dials. A dial's image is its segment of the touchscreen strip.

use std::sync::Arc;

use image::RgbaImage;

use super::{ComposeRequest, ControllerInput};
use crate::actions::InputEvent;
use crate::controller::DeckController;
use crate::device::{Deck, DeckEvent};
use crate::identifier::InputIdentifier;

/// `(x, width, height)` of a dial's touchscreen segment.
pub fn segment(deck: &dyn Deck, dial: u8) -> Option<(u32, u32, u32)> {
    let (width, height) = deck.touchscreen_size()?;
    let dials = u32::from(deck.dial_count());
    if dials == 0 || u32::from(dial) >= dials {
        return None;
    }
    let segment_w = width / dials;
    Some((u32::from(dial) * segment_w, segment_w, height))
}

/// The dial whose segment contains touchscreen column `x`.
pub fn dial_at(deck: &dyn Deck, x: u16) -> Option<u8> {
    let (width, _) = deck.touchscreen_size()?;
    let dials = u32::from(deck.dial_count());
    if dials == 0 {
        return None;
    }
    let segment_w = (width / dials).max(1);
    let dial = (u32::from(x) / segment_w).min(dials - 1);
    Some(dial as u8)
}

pub(crate) fn handle_event(input: &Arc<ControllerInput>, controller: &Arc<DeckController>, event: DeckEvent) {
    match event {
        DeckEvent::DialDown(_) => input.press_down(controller),
        DeckEvent::DialUp(_) => input.press_up(controller),
        DeckEvent::DialTurn(_, ticks) if ticks > 0 => input.dispatch(controller, InputEvent::TurnCw),
        DeckEvent::DialTurn(_, ticks) if ticks < 0 => input.dispatch(controller, InputEvent::TurnCcw),
        DeckEvent::TouchShort { .. } => input.dispatch(controller, InputEvent::ShortTouchPress),
        DeckEvent::TouchLong { .. } => input.dispatch(controller, InputEvent::LongTouchPress),
        other => log::debug!("Dial {} ignores {other:?}", input.identifier()),
    }
}

pub(crate) fn render(input: &ControllerInput, controller: &DeckController) -> RgbaImage {
    let InputIdentifier::Dial(dial) = input.identifier() else {
        return RgbaImage::new(1, 1);
    };
    let Some((_, width, height)) = segment(controller.deck(), *dial) else {
        return RgbaImage::new(1, 1);
    };
    input.get_active_state().compose(&ComposeRequest {
        size: (width, height),
        tile: None,
        pressed: input.is_pressed(),
        shrink_factor: controller.settings().pressed_shrink_factor,
        show_warning: !controller.screensaver().is_showing(),
        fonts: controller.fonts(),
    })
}
