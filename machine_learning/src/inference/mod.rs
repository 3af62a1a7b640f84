//! Sliding-window inference over volumes larger than the model's input.

mod blend;
mod grid;
mod window;

pub use blend::{BlendMode, blend_weights};
pub use grid::{PatchGrid, axis_origins};
pub use window::{SlidingWindow, argmax_classes};
