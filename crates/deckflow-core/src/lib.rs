//! deckflow core.
//!
//! Renders the live state of Stream Deck style devices from page files and keeps it in sync
//! with hardware input. Frontends (the `deckflow` daemon, a settings UI) drive it through
//! [`manager::DeckManager`] and [`controller::DeckController`].

pub mod actions;
pub mod background;
pub mod context;
pub mod controller;
pub mod device;
pub mod identifier;
pub mod inputs;
pub mod manager;
pub mod media;
pub mod media_player;
pub mod page;
pub mod render;
pub mod scheduler;
pub mod screensaver;
pub mod shared;
pub mod store;
pub mod tick;
pub mod ui;
pub mod workers;

pub use context::DeckContext;
pub use controller::DeckController;
pub use manager::DeckManager;
