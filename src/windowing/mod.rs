mod sliding_window;
mod window_instance;

pub use sliding_window::{ClosedWindow, SlidingWindow};
pub use window_instance::WindowInstance;
