//! Out-of-process resource reaper.
//!
//! The session side lives in [`client`], the daemon side in [`server`]; both
//! remove resources through the [`Sweeper`]. When no reaper is listening the
//! session starts one through a [`ReaperLauncher`].

pub mod client;
pub mod launch;
pub mod protocol;
pub mod server;
pub mod sweep;

pub use client::ReaperConnection;
pub use launch::{ProcessLauncher, ReaperLauncher};
pub use server::{ReaperConfig, ReaperServer};
pub use sweep::Sweeper;
