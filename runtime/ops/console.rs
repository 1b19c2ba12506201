// Copyright 2024-2026 the jsbox authors. MIT license.

//! Console state and Node-style argument formatting. Entries are shipped to
//! the host through the `console.onEntry` callback; the counters, timers
//! and group depth live here so the soft-dispose reset routine can clear
//! them without touching user globals.

use jsbox_core::protocol::ConsoleEntry;
use jsbox_core::protocol::ConsoleLevel;
use jsbox_core::value::Value;
use std::collections::HashMap;
use std::time::Instant;

#[derive(Default)]
pub struct ConsoleState {
  counts: HashMap<String, u64>,
  timers: HashMap<String, Instant>,
  group_depth: usize,
}

impl ConsoleState {
  pub fn new() -> ConsoleState {
    ConsoleState::default()
  }

  /// Soft-dispose reset: ephemeral state only.
  pub fn reset(&mut self) {
    self.counts.clear();
    self.timers.clear();
    self.group_depth = 0;
  }

  pub fn entry(
    &self,
    kind: &str,
    level: ConsoleLevel,
    args: Vec<Value>,
  ) -> ConsoleEntry {
    let formatted = format_args(&args);
    ConsoleEntry {
      kind: kind.to_string(),
      level,
      stdout: self.indent(&formatted),
      args,
    }
  }

  pub fn count(&mut self, label: &str) -> ConsoleEntry {
    let n = self.counts.entry(label.to_string()).or_insert(0);
    *n += 1;
    let text = format!("{label}: {n}");
    ConsoleEntry {
      kind: "count".to_string(),
      level: ConsoleLevel::Log,
      stdout: self.indent(&text),
      args: vec![Value::String(text)],
    }
  }

  pub fn count_reset(&mut self, label: &str) {
    self.counts.remove(label);
  }

  pub fn time(&mut self, label: &str) {
    self.timers.entry(label.to_string()).or_insert_with(Instant::now);
  }

  pub fn time_end(&mut self, label: &str) -> ConsoleEntry {
    let text = match self.timers.remove(label) {
      Some(started) => {
        format!("{label}: {:.3}ms", started.elapsed().as_secs_f64() * 1000.0)
      }
      None => format!("Timer '{label}' does not exist"),
    };
    ConsoleEntry {
      kind: "timeEnd".to_string(),
      level: ConsoleLevel::Log,
      stdout: self.indent(&text),
      args: vec![Value::String(text)],
    }
  }

  pub fn group(&mut self, args: Vec<Value>) -> ConsoleEntry {
    let entry = self.entry("group", ConsoleLevel::Log, args);
    self.group_depth += 1;
    entry
  }

  pub fn group_end(&mut self) {
    self.group_depth = self.group_depth.saturating_sub(1);
  }

  fn indent(&self, text: &str) -> String {
    if self.group_depth == 0 {
      return text.to_string();
    }
    let pad = "  ".repeat(self.group_depth);
    text
      .lines()
      .map(|line| format!("{pad}{line}"))
      .collect::<Vec<_>>()
      .join("\n")
  }
}

/// Node-style space-joined formatting of console arguments.
pub fn format_args(args: &[Value]) -> String {
  args.iter().map(format_value).collect::<Vec<_>>().join(" ")
}

fn format_value(value: &Value) -> String {
  match value {
    // Top-level strings print bare, like Node.
    Value::String(s) => s.clone(),
    other => inspect(other),
  }
}

/// `util.inspect`-flavored rendering for non-string values and nesting.
fn inspect(value: &Value) -> String {
  match value {
    Value::Undefined => "undefined".to_string(),
    Value::Null => "null".to_string(),
    Value::Bool(b) => b.to_string(),
    Value::Number(n) => {
      if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", *n as i64)
      } else {
        format!("{n}")
      }
    }
    Value::String(s) => format!("'{s}'"),
    Value::Bytes(buf) => format!("<Buffer {} bytes>", buf.len()),
    Value::Array(items) => {
      let inner =
        items.iter().map(inspect).collect::<Vec<_>>().join(", ");
      format!("[ {inner} ]")
    }
    Value::Object(entries) => {
      if let Some(text) = format_error_object(value) {
        return text;
      }
      if entries.is_empty() {
        return "{}".to_string();
      }
      let inner = entries
        .iter()
        .map(|(k, v)| format!("{k}: {}", inspect(v)))
        .collect::<Vec<_>>()
        .join(", ");
      format!("{{ {inner} }}")
    }
    Value::StreamRef(_) | Value::IteratorRef(_) => {
      "[object ReadableStream]".to_string()
    }
    Value::CallbackRef(_) => "[Function]".to_string(),
  }
}

/// An Error crossing the console boundary is an object with `name`,
/// `message` and optionally `stack`; it prints as `Name: message` followed
/// by the stack frames, source filenames intact.
fn format_error_object(value: &Value) -> Option<String> {
  let obj = value.as_object()?;
  let name = obj.get("name")?.as_str()?;
  let message = obj.get("message")?.as_str()?;
  match obj.get("stack").and_then(Value::as_str) {
    // Stack text already begins with "Name: message".
    Some(stack) if stack.starts_with(name) => Some(stack.to_string()),
    Some(stack) => Some(format!("{name}: {message}\n{stack}")),
    None => Some(format!("{name}: {message}")),
  }
}
