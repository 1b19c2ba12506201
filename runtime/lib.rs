// Copyright 2024-2026 the jsbox authors. MIT license.

//! The jsbox runtime: isolate workers, the per-connection bridge mux, the
//! streaming marshaller, the namespace registry and the daemon control
//! plane. `jsbox_core` defines what crosses the wire and the engine
//! boundary; this crate makes it run.

pub mod bridge;
pub mod daemon;
pub mod ops;
pub mod registry;
pub mod streams;
pub mod testenv;
pub mod worker;

pub use bridge::Bridge;
pub use bridge::CallHandler;
pub use daemon::start_daemon;
pub use daemon::Daemon;
pub use daemon::DaemonOptions;
pub use registry::Registry;
pub use worker::IsolateHandle;
