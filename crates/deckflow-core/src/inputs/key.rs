use std::sync::Arc;

use image::RgbaImage;

use super::{ComposeRequest, ControllerInput};
use crate::controller::DeckController;
use crate::device::DeckEvent;

pub(crate) fn handle_event(input: &Arc<ControllerInput>, controller: &Arc<DeckController>, event: DeckEvent) {
    match event {
        DeckEvent::KeyDown(_) => input.press_down(controller),
        DeckEvent::KeyUp(_) => input.press_up(controller),
        other => log::debug!("Key {} ignores {other:?}", input.identifier()),
    }
}

pub(crate) fn render(input: &ControllerInput, controller: &DeckController) -> RgbaImage {
    let deck = controller.deck();
    let (_, columns) = deck.key_layout();
    let index = input.identifier().key_index(columns);
    let background = controller.background();
    let tile = || index.and_then(|i| background.tile(i));
    input.get_active_state().compose(&ComposeRequest {
        size: deck.key_image_size(),
        tile: Some(&tile),
        pressed: input.is_pressed(),
        shrink_factor: controller.settings().pressed_shrink_factor,
        show_warning: !controller.screensaver().is_showing(),
        fonts: controller.fonts(),
    })
}
