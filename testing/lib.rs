// Copyright 2024-2026 the jsbox authors. MIT license.

//! Test doubles for the jsbox suites: a scriptable implementation of the
//! engine collaborator traits, and a typed client that speaks the bridge
//! protocol over a real socket. Integration tests wire both to a running
//! daemon and drive every control operation end to end.

pub mod client;
pub mod engine;

pub use client::Client;
pub use client::TestHost;
pub use engine::Expr;
pub use engine::ScriptEngine;
pub use engine::Step;
