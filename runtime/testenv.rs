// Copyright 2024-2026 the jsbox authors. MIT license.

//! Registration and scheduling for the in-isolate test DSL. The matcher
//! surface (`expect` and friends) is sandbox glue; what lives here is the
//! queue the DSL fills — suites, tests, hooks — and the pure planning step
//! that turns it into an execution order the worker can drive callback by
//! callback: `beforeAll` once per suite, `beforeEach` per test outer-first,
//! `afterEach` inner-first, `afterAll` when the last test of a suite ran.

use jsbox_core::error::ErrorEnvelope;
use jsbox_core::value::Value;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestMode {
  Normal,
  Skip,
  Todo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookKind {
  BeforeAll,
  BeforeEach,
  AfterEach,
  AfterAll,
}

struct RegisteredTest {
  name: String,
  suite_path: Vec<String>,
  callback: u64,
  mode: TestMode,
}

struct RegisteredHook {
  kind: HookKind,
  suite_path: Vec<String>,
  callback: u64,
}

#[derive(Default)]
pub struct TestEnv {
  tests: Vec<RegisteredTest>,
  hooks: Vec<RegisteredHook>,
}

/// One test with every hook callback that frames it, resolved.
pub struct TestPlan {
  pub name: String,
  pub mode: TestMode,
  pub callback: u64,
  pub before: Vec<u64>,
  pub after: Vec<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestReport {
  pub passed: u32,
  pub failed: u32,
  pub skipped: u32,
  pub total: u32,
  pub tests: Vec<TestResult>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
  pub name: String,
  pub status: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl TestEnv {
  pub fn new() -> TestEnv {
    TestEnv::default()
  }

  pub fn register_test(
    &mut self,
    name: &str,
    suite_path: Vec<String>,
    callback: u64,
    mode: TestMode,
  ) {
    self.tests.push(RegisteredTest {
      name: name.to_string(),
      suite_path,
      callback,
      mode,
    });
  }

  pub fn register_hook(
    &mut self,
    kind: HookKind,
    suite_path: Vec<String>,
    callback: u64,
  ) {
    self.hooks.push(RegisteredHook { kind, suite_path, callback });
  }

  /// Clears the queue; the module cache is untouched by design.
  pub fn reset(&mut self) {
    self.tests.clear();
    self.hooks.clear();
  }

  pub fn is_empty(&self) -> bool {
    self.tests.is_empty()
  }

  fn hooks_for(
    &self,
    kind: HookKind,
    suite_path: &[String],
  ) -> Vec<u64> {
    self
      .hooks
      .iter()
      .filter(|h| h.kind == kind && h.suite_path == suite_path)
      .map(|h| h.callback)
      .collect()
  }

  /// Builds the execution order in registration order of the tests.
  pub fn plan(&self) -> Vec<TestPlan> {
    let mut plans = Vec::with_capacity(self.tests.len());
    for (index, test) in self.tests.iter().enumerate() {
      let mut before = Vec::new();
      let mut after = Vec::new();

      // `beforeAll` of every suite whose first test this is, outer-first.
      for depth in 1..=test.suite_path.len() {
        let prefix = &test.suite_path[..depth];
        let first_in_suite = self.tests[..index]
          .iter()
          .all(|t| !starts_with(&t.suite_path, prefix));
        if first_in_suite {
          before.extend(self.hooks_for(HookKind::BeforeAll, prefix));
        }
      }
      // `beforeEach` of every enclosing suite, outer-first. The root
      // (empty path) applies to all tests.
      for depth in 0..=test.suite_path.len() {
        before
          .extend(self.hooks_for(HookKind::BeforeEach, &test.suite_path[..depth]));
      }
      // `afterEach` inner-first.
      for depth in (0..=test.suite_path.len()).rev() {
        after
          .extend(self.hooks_for(HookKind::AfterEach, &test.suite_path[..depth]));
      }
      // `afterAll` of every suite whose last test this is, inner-first.
      for depth in (1..=test.suite_path.len()).rev() {
        let prefix = &test.suite_path[..depth];
        let last_in_suite = self.tests[index + 1..]
          .iter()
          .all(|t| !starts_with(&t.suite_path, prefix));
        if last_in_suite {
          after.extend(self.hooks_for(HookKind::AfterAll, prefix));
        }
      }

      let name = if test.suite_path.is_empty() {
        test.name.clone()
      } else {
        format!("{} > {}", test.suite_path.join(" > "), test.name)
      };
      plans.push(TestPlan {
        name,
        mode: test.mode,
        callback: test.callback,
        before,
        after,
      });
    }
    plans
  }
}

fn starts_with(path: &[String], prefix: &[String]) -> bool {
  path.len() >= prefix.len() && &path[..prefix.len()] == prefix
}

impl TestReport {
  pub fn record(
    &mut self,
    name: &str,
    mode: TestMode,
    outcome: Option<Result<(), ErrorEnvelope>>,
  ) {
    self.total += 1;
    let (status, error) = match (mode, outcome) {
      (TestMode::Skip, _) => {
        self.skipped += 1;
        ("skipped", None)
      }
      (TestMode::Todo, _) => {
        self.skipped += 1;
        ("todo", None)
      }
      (TestMode::Normal, Some(Ok(()))) => {
        self.passed += 1;
        ("passed", None)
      }
      (TestMode::Normal, Some(Err(env))) => {
        self.failed += 1;
        ("failed", Some(env.to_string()))
      }
      (TestMode::Normal, None) => {
        self.failed += 1;
        ("failed", Some("test did not run".to_string()))
      }
    };
    self.tests.push(TestResult {
      name: name.to_string(),
      status: status.to_string(),
      error,
    });
  }

  pub fn to_value(&self) -> Value {
    Value::object([
      ("passed".to_string(), Value::Number(self.passed as f64)),
      ("failed".to_string(), Value::Number(self.failed as f64)),
      ("skipped".to_string(), Value::Number(self.skipped as f64)),
      ("total".to_string(), Value::Number(self.total as f64)),
      (
        "tests".to_string(),
        Value::Array(
          self
            .tests
            .iter()
            .map(|t| {
              let mut entries = vec![
                ("name".to_string(), Value::String(t.name.clone())),
                ("status".to_string(), Value::String(t.status.clone())),
              ];
              if let Some(error) = &t.error {
                entries
                  .push(("error".to_string(), Value::String(error.clone())));
              }
              Value::object(entries)
            })
            .collect(),
        ),
      ),
    ])
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  fn path(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn hook_scheduling_around_suites() {
    let mut env = TestEnv::new();
    env.register_hook(HookKind::BeforeAll, path(&["suite"]), 10);
    env.register_hook(HookKind::BeforeEach, path(&["suite"]), 11);
    env.register_hook(HookKind::AfterEach, path(&["suite"]), 12);
    env.register_hook(HookKind::AfterAll, path(&["suite"]), 13);
    env.register_test("one", path(&["suite"]), 1, TestMode::Normal);
    env.register_test("two", path(&["suite"]), 2, TestMode::Normal);

    let plans = env.plan();
    assert_eq!(plans.len(), 2);
    // First test: beforeAll fires once.
    assert_eq!(plans[0].before, vec![10, 11]);
    assert_eq!(plans[0].after, vec![12]);
    assert_eq!(plans[0].name, "suite > one");
    // Last test: afterAll fires once.
    assert_eq!(plans[1].before, vec![11]);
    assert_eq!(plans[1].after, vec![12, 13]);
  }

  #[test]
  fn nested_suites_order_outer_first_then_inner_first() {
    let mut env = TestEnv::new();
    env.register_hook(HookKind::BeforeEach, vec![], 1);
    env.register_hook(HookKind::BeforeEach, path(&["a"]), 2);
    env.register_hook(HookKind::BeforeEach, path(&["a", "b"]), 3);
    env.register_hook(HookKind::AfterEach, path(&["a", "b"]), 4);
    env.register_hook(HookKind::AfterEach, vec![], 5);
    env.register_test("t", path(&["a", "b"]), 9, TestMode::Normal);

    let plans = env.plan();
    assert_eq!(plans[0].before, vec![1, 2, 3]);
    assert_eq!(plans[0].after, vec![4, 5]);
  }

  #[test]
  fn report_counts_and_statuses() {
    let mut report = TestReport::default();
    report.record("ok", TestMode::Normal, Some(Ok(())));
    report.record(
      "bad",
      TestMode::Normal,
      Some(Err(ErrorEnvelope::new(
        jsbox_core::error::ErrorKind::UserError,
        "Error",
        "expected 1 to be 2",
      ))),
    );
    report.record("later", TestMode::Skip, None);
    report.record("someday", TestMode::Todo, None);

    assert_eq!(report.passed, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.total, 4);
    assert_eq!(report.tests[1].error.as_deref(), Some("Error: expected 1 to be 2"));
    assert_eq!(report.tests[3].status, "todo");
  }

  #[test]
  fn reset_clears_the_queue() {
    let mut env = TestEnv::new();
    env.register_test("t", vec![], 1, TestMode::Normal);
    assert!(!env.is_empty());
    env.reset();
    assert!(env.is_empty());
    assert!(env.plan().is_empty());
  }
}
