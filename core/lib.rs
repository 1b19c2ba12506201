// Copyright 2024-2026 the jsbox authors. MIT license.

//! Core building blocks of the jsbox sandbox daemon: the tagged value model
//! and frame codec spoken on the Unix socket, the error envelope that crosses
//! the host/sandbox boundary, the embedding interface of the JavaScript
//! engine, and the module graph.
//!
//! Everything in this crate is transport- and engine-agnostic. The daemon,
//! the isolate workers and the streaming marshaller live in `jsbox_runtime`.

pub mod codec;
pub mod engine;
pub mod error;
pub mod modules;
pub mod path_util;
pub mod protocol;
pub mod value;

pub use codec::Frame;
pub use codec::FrameCodec;
pub use codec::FrameKind;
pub use error::ErrorEnvelope;
pub use error::ErrorKind;
pub use error::JsError;
pub use value::Value;
