// Copyright 2024-2026 the jsbox authors. MIT license.

//! POSIX path handling for module canonicalization and the sandbox `path`
//! utilities. Paths on this boundary are plain strings with `/` separators
//! regardless of the daemon's platform; module identity must not depend on
//! where the daemon runs.

/// Normalizes `.` and `..` segments and collapses duplicate slashes without
/// touching the filesystem.
pub fn normalize(path: &str) -> String {
  let absolute = path.starts_with('/');
  let mut out: Vec<&str> = Vec::new();
  for comp in path.split('/') {
    match comp {
      "" | "." => {}
      ".." => {
        match out.last() {
          Some(&"..") | None if !absolute => out.push(".."),
          Some(_) => {
            out.pop();
          }
          // `/..` stays at the root.
          None => {}
        }
      }
      other => out.push(other),
    }
  }
  let joined = out.join("/");
  if absolute {
    format!("/{joined}")
  } else if joined.is_empty() {
    ".".to_string()
  } else {
    joined
  }
}

/// Joins and normalizes. Absolute `filename` wins over `base`.
pub fn join(base: &str, filename: &str) -> String {
  if filename.starts_with('/') {
    normalize(filename)
  } else if base.is_empty() {
    normalize(filename)
  } else {
    normalize(&format!("{base}/{filename}"))
  }
}

/// Parent directory of a normalized path.
pub fn dirname(path: &str) -> String {
  match path.rfind('/') {
    Some(0) => "/".to_string(),
    Some(idx) => path[..idx].to_string(),
    None => ".".to_string(),
  }
}

/// Final path segment.
pub fn basename(path: &str) -> String {
  match path.rfind('/') {
    Some(idx) => path[idx + 1..].to_string(),
    None => path.to_string(),
  }
}

/// File extension including the dot, or empty.
pub fn extname(path: &str) -> String {
  let base = basename(path);
  match base.rfind('.') {
    Some(idx) if idx > 0 => base[idx..].to_string(),
    _ => String::new(),
  }
}

/// Forces a caller-supplied filename into a POSIX absolute path, the form
/// used for the entry script's importer record.
pub fn to_absolute(filename: &str, cwd: &str) -> String {
  let slashed = filename.replace('\\', "/");
  if slashed.starts_with('/') {
    normalize(&slashed)
  } else {
    join(cwd, &slashed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn normalize_resolves_dots() {
    assert_eq!(normalize("a/../b"), "b");
    assert_eq!(normalize("a/./b/../c"), "a/c");
    assert_eq!(normalize("/a//b/"), "/a/b");
    assert_eq!(normalize("/../a"), "/a");
    assert_eq!(normalize("../a"), "../a");
    assert_eq!(normalize("./"), ".");
  }

  #[test]
  fn join_prefers_absolute_filename() {
    assert_eq!(join("/src", "./util.js"), "/src/util.js");
    assert_eq!(join("/src", "../lib/x.js"), "/lib/x.js");
    assert_eq!(join("/src", "/abs/y.js"), "/abs/y.js");
  }

  #[test]
  fn dirname_and_basename() {
    assert_eq!(dirname("/a/b/c.js"), "/a/b");
    assert_eq!(dirname("/c.js"), "/");
    assert_eq!(basename("/a/b/c.test.js"), "c.test.js");
    assert_eq!(extname("/a/b/c.test.js"), ".js");
    assert_eq!(extname("/a/b/Makefile"), "");
  }

  #[test]
  fn entry_filenames_become_posix_absolute() {
    assert_eq!(to_absolute("main.js", "/work"), "/work/main.js");
    assert_eq!(to_absolute("/main.js", "/work"), "/main.js");
    assert_eq!(to_absolute("src\\main.js", "/work"), "/work/src/main.js");
  }
}
