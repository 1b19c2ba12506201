// Copyright 2024-2026 the jsbox authors. MIT license.

//! Scan-level source analysis: module format inference and import/export
//! extraction. This is deliberately not a full parser — the engine
//! collaborator parses for real; the graph only needs specifiers, export
//! names and a format guess, the same way the loader protocol defines them.

use lazy_regex::regex;
use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleFormat {
  Esm,
  Cjs,
}

/// Import/export descriptors extracted from one module source.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModuleInfo {
  /// Sources of static `import ... from S` and `import S` declarations.
  pub imports: Vec<String>,
  /// Locally declared export names (`export const x`, `export function f`,
  /// `export { a as b }` without a `from` clause exports `b`).
  pub local_exports: Vec<String>,
  pub has_default_export: bool,
  /// `export { a as b } from S` → (`b`, `S`).
  pub named_reexports: Vec<(String, String)>,
  /// `export * from S`.
  pub star_reexports: Vec<String>,
  /// `export * as ns from S` → (`ns`, `S`).
  pub star_as_reexports: Vec<(String, String)>,
  /// Literal `require("...")` arguments, for dependency prefetch.
  pub require_specifiers: Vec<String>,
}

impl ModuleInfo {
  /// Every specifier that must be resolvable before evaluation: static
  /// imports, re-export sources and literal requires.
  pub fn dependency_specifiers(&self) -> Vec<String> {
    let mut out = Vec::new();
    let mut push = |s: &String| {
      if !out.contains(s) {
        out.push(s.clone());
      }
    };
    self.imports.iter().for_each(&mut push);
    self.named_reexports.iter().for_each(|(_, s)| push(s));
    self.star_reexports.iter().for_each(&mut push);
    self.star_as_reexports.iter().for_each(|(_, s)| push(s));
    self.require_specifiers.iter().for_each(&mut push);
    out
  }

  pub fn has_module_syntax(&self) -> bool {
    !self.imports.is_empty()
      || !self.local_exports.is_empty()
      || self.has_default_export
      || !self.named_reexports.is_empty()
      || !self.star_reexports.is_empty()
      || !self.star_as_reexports.is_empty()
  }
}

/// Infers the format when the loader did not state one: top-level
/// `import`/`export` wins, then CommonJS markers, then ESM by default.
pub fn infer_format(source: &str) -> ModuleFormat {
  if parse(source).has_module_syntax() {
    return ModuleFormat::Esm;
  }
  let cjs_marker = regex!(
    r"(?m)(?:^|[^.\w$])(?:module\s*\.\s*exports|exports\s*\.\s*[\w$]+\s*=|exports\s*\[|require\s*\()"
  );
  if cjs_marker.is_match(source) {
    return ModuleFormat::Cjs;
  }
  ModuleFormat::Esm
}

/// Extracts import/export descriptors. Line comments are stripped first so
/// commented-out declarations don't register; string bodies are left alone
/// (a false positive there costs one failed loader round-trip, not
/// correctness).
pub fn parse(source: &str) -> ModuleInfo {
  let source = strip_line_comments(source);
  let mut info = ModuleInfo::default();

  // `import d, { a } from "s"`, `import * as ns from "s"`, `import "s"`.
  let import_re = regex!(
    r#"(?m)^\s*import\s+(?:[\w$]+\s*,\s*)?(?:[\w$]+|\*\s+as\s+[\w$]+|\{[^}]*\})?\s*(?:from\s+)?["']([^"']+)["']"#
  );
  for cap in import_re.captures_iter(&source) {
    push_unique(&mut info.imports, cap[1].to_string());
  }

  // `export * as ns from "s"` before the plain star form.
  let star_as_re = regex!(
    r#"(?m)^\s*export\s+\*\s+as\s+([\w$]+)\s+from\s+["']([^"']+)["']"#
  );
  for cap in star_as_re.captures_iter(&source) {
    info
      .star_as_reexports
      .push((cap[1].to_string(), cap[2].to_string()));
  }

  let star_re =
    regex!(r#"(?m)^\s*export\s+\*\s+from\s+["']([^"']+)["']"#);
  for cap in star_re.captures_iter(&source) {
    push_unique(&mut info.star_reexports, cap[1].to_string());
  }

  // `export { a, b as c } [from "s"]`.
  let named_re = regex!(
    r#"(?m)^\s*export\s*\{([^}]*)\}\s*(?:from\s+["']([^"']+)["'])?"#
  );
  for cap in named_re.captures_iter(&source) {
    let names = cap[1]
      .split(',')
      .map(|part| {
        let part = part.trim();
        match part.split_once(" as ") {
          Some((_, alias)) => alias.trim().to_string(),
          None => part.to_string(),
        }
      })
      .filter(|name| !name.is_empty());
    match cap.get(2) {
      Some(src) => {
        for name in names {
          info.named_reexports.push((name, src.as_str().to_string()));
        }
      }
      None => {
        for name in names {
          if name == "default" {
            info.has_default_export = true;
          } else {
            push_unique(&mut info.local_exports, name);
          }
        }
      }
    }
  }

  let decl_re = regex!(
    r"(?m)^\s*export\s+(?:async\s+)?(?:const|let|var|function\*?|class)\s+([\w$]+)"
  );
  for cap in decl_re.captures_iter(&source) {
    push_unique(&mut info.local_exports, cap[1].to_string());
  }

  if regex!(r"(?m)^\s*export\s+default\b").is_match(&source) {
    info.has_default_export = true;
  }

  let require_re = regex!(r#"require\s*\(\s*["']([^"']+)["']\s*\)"#);
  for cap in require_re.captures_iter(&source) {
    push_unique(&mut info.require_specifiers, cap[1].to_string());
  }

  info
}

fn push_unique(list: &mut Vec<String>, item: String) {
  if !list.contains(&item) {
    list.push(item);
  }
}

fn strip_line_comments(source: &str) -> String {
  source
    .lines()
    .map(|line| {
      // Only strip comments that start the line; `//` inside strings or
      // after code would need a real lexer to handle safely.
      if line.trim_start().starts_with("//") { "" } else { line }
    })
    .collect::<Vec<_>>()
    .join("\n")
}
