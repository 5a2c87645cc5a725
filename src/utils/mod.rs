//! Shared utilities for Overseer
//!
//! Time sources and filesystem path helpers used across the security components.

pub mod clock;
pub mod paths;

pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use paths::{
    ensure_parent_dir,
    expand_path,
    normalize_path,
    overseer_home,
    write_private_file,
};
