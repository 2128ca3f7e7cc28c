//! Out-of-process VST2 plugin bridge core.
//!
//! This crate is the plugin-side endpoint of a cross-ABI plugin bridge: it
//! presents a normal in-process `AEffect` to a native host while the real
//! plugin runs inside a child process under a foreign-ABI loader. Three
//! transports connect the two processes:
//!
//! - a **control port** (shared memory + semaphore pair) for the handshake
//!   and non-audio dispatches,
//! - an **audio port** (same mechanism, sized per block) for `process*`,
//!   parameter access and off-main-thread dispatches,
//! - a **callback port** plus a lossy kernel **frame queue** on which the
//!   child requests host services.
//!
//! ## Benefits
//!
//! - **Crash isolation**: the foreign plugin cannot take the host down
//! - **ABI freedom**: the child runs under whatever loader the plugin needs
//! - **Real-time honesty**: audio dispatches never contend with UI work
//!
//! Linux only: the wire protocol relies on System V shared memory ids,
//! attach counts and message queues.

pub mod error;
pub use error::{BridgeError, Result};

pub mod protocol;
pub use protocol::{Command, DataFrame, PluginInfo};

pub mod vst2;

pub mod event;
pub use event::Event;

pub mod data_port;
pub use data_port::DataPort;

pub mod frame_queue;
pub use frame_queue::{FrameBuf, FrameQueue, CALLBACK_FRAME_SIZE};

pub mod endpoint;
pub use endpoint::{
    load, BridgeConfig, ChildHandle, HostLauncher, LoaderLauncher, PluginEndpoint,
};

pub mod window;
pub use window::{DiscardEmbedder, WindowEmbedder};

mod audio;
mod callbacks;
mod dispatcher;
