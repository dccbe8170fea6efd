//! boardd-server library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # Module map
//!
//! ```text
//! reactor   -- single-threaded poll(2) loop: fd sources + one-shot timers
//! config    -- TOML device-fleet configuration loader
//! hw        -- BoardControl capability trait + hardware backends
//! device    -- board registry, runtime state, lifecycle sequencing, lockfile
//! boot      -- boot-stage orchestrator, hotplug monitor, flash backends
//! session   -- frame dispatcher over stdin/stdout
//! ```

pub mod boot;
pub mod config;
pub mod device;
pub mod hw;
pub mod reactor;
pub mod session;
