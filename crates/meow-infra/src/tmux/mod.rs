//! tmux-backed agent session driver.

pub mod driver;

pub use driver::TmuxDriver;
