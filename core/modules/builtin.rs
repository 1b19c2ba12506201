// Copyright 2024-2026 the jsbox authors. MIT license.

//! Built-in module fallback. When the host loader is absent or rejects a
//! `node:*` specifier (or its bare alias from the closed set below), the
//! graph substitutes a bundled in-isolate implementation. A loader that
//! resolves the specifier always wins — the fallback is a floor, not an
//! override.

/// Bare names with a bundled fallback. `node:`-prefixed forms alias these.
pub const BUILTIN_NAMES: &[&str] = &["crypto", "events", "stream", "process"];

/// Maps a specifier to its builtin name, accepting both `crypto` and
/// `node:crypto`. Unknown names — even with a `node:` prefix — get no
/// fallback.
pub fn builtin_name(specifier: &str) -> Option<&'static str> {
  let bare = specifier.strip_prefix("node:").unwrap_or(specifier);
  BUILTIN_NAMES.iter().copied().find(|name| *name == bare)
}

/// Canonical id used for builtin records, so `crypto` and `node:crypto`
/// share one cache entry.
pub fn canonical_id(name: &str) -> String {
  format!("node:{name}")
}

pub fn source(name: &str) -> Option<&'static str> {
  match name {
    "crypto" => Some(include_str!("js/crypto.js")),
    "events" => Some(include_str!("js/events.js")),
    "stream" => Some(include_str!("js/stream.js")),
    "process" => Some(include_str!("js/process.js")),
    _ => None,
  }
}
