//! Layer adapters for tunchain
//!
//! Ready-made [`LayerHandle`](tunchain_core::LayerHandle) implementations:
//!
//! - [`ProcessLayer`] runs an engine binary as a child process
//!   ([`RelayCommand`] and [`CoreCommand`] build the command lines)
//! - [`NativeLayer`] drives an engine linked in as native code through a
//!   [`NativeBackend`]
//!
//! ```rust,ignore
//! let layers = LayerSet::new()
//!     .with(ProcessLayer::new(RelayCommand::new("/opt/relay")))
//!     .with(NativeLayer::new(shaper_backend))
//!     .with(ProcessLayer::new(CoreCommand::new("/opt/core")));
//! ```

mod core_engine;
mod native;
mod process;
mod relay;

pub use core_engine::CoreCommand;
pub use native::{NativeBackend, NativeHandle, NativeLayer};
pub use process::{CommandSpec, ProcessCommand, ProcessLayer, ReadinessProbe};
pub use relay::RelayCommand;
