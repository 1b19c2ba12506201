// Copyright 2024-2026 the jsbox authors. MIT license.

//! End-to-end suites: a real daemon on a real Unix socket, the scriptable
//! engine behind it, and the typed client in front.

use jsbox_core::error::ErrorKind;
use jsbox_core::protocol::Capabilities;
use jsbox_core::protocol::CreateRuntimeOptions;
use jsbox_core::protocol::CustomFnMode;
use jsbox_core::protocol::CustomFnSpec;
use jsbox_core::protocol::EvalOptions;
use jsbox_core::protocol::RequestSpec;
use jsbox_core::protocol::ResponseSpec;
use jsbox_core::value::Value;
use jsbox_runtime::start_daemon;
use jsbox_runtime::Daemon;
use jsbox_runtime::DaemonOptions;
use jsbox_testing::client::CustomReply;
use jsbox_testing::Client;
use jsbox_testing::Expr;
use jsbox_testing::ScriptEngine;
use jsbox_testing::Step;
use jsbox_testing::TestHost;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
  daemon: Daemon,
  _dir: tempfile::TempDir,
}

async fn start(engine: &ScriptEngine, max_isolates: usize) -> Harness {
  let _ = env_logger::builder().is_test(true).try_init();
  let dir = tempfile::tempdir().unwrap();
  let daemon = start_daemon(
    DaemonOptions {
      socket_path: dir.path().join("jsbox.sock"),
      max_isolates,
    },
    Arc::new(engine.clone()),
  )
  .await
  .unwrap();
  Harness { daemon, _dir: dir }
}

impl Harness {
  async fn client(&self) -> Client {
    Client::connect(self.daemon.socket_path(), TestHost::new())
      .await
      .unwrap()
  }
}

fn base_options() -> CreateRuntimeOptions {
  CreateRuntimeOptions {
    capabilities: Capabilities {
      console: true,
      module_loader: true,
      fetch: true,
      test_env: true,
      ..Default::default()
    },
    ..Default::default()
  }
}

fn s(text: &str) -> String {
  text.to_string()
}

fn lit(v: Value) -> Expr {
  Expr::Lit(v)
}

fn log_args(args: Vec<Expr>) -> Step {
  let mut full = vec![lit("log".into()), lit("log".into())];
  full.extend(args);
  Step::CallOp { name: s("op_console_entry"), args: full, bind: None }
}

// ---------------------------------------------------------------------------
// Lifecycle & namespaces
// ---------------------------------------------------------------------------

#[tokio::test]
async fn anonymous_isolates_get_fresh_ids() {
  let engine = ScriptEngine::new();
  let harness = start(&engine, 4).await;
  let client = harness.client().await;

  let (id1, reused1) =
    client.create_runtime(base_options(), None).await.unwrap();
  client.dispose(&id1).await.unwrap();
  let (id2, reused2) =
    client.create_runtime(base_options(), None).await.unwrap();

  assert!(!reused1);
  assert!(!reused2);
  assert_ne!(id1, id2);
}

#[tokio::test]
async fn namespace_reuse_preserves_id_and_globals() {
  let engine = ScriptEngine::new();
  engine.program(
    "globalThis.x = 1",
    vec![Step::SetGlobal(s("x"), lit(Value::Number(1.0)))],
  );
  engine.program(
    "console.log(globalThis.x)",
    vec![log_args(vec![Expr::GlobalGet(s("x"))])],
  );

  let harness = start(&engine, 4).await;
  let client = harness.client().await;

  let (id1, reused1) =
    client.create_runtime(base_options(), Some("n")).await.unwrap();
  assert!(!reused1);
  client.eval(&id1, "globalThis.x = 1", EvalOptions::default()).await.unwrap();
  client.dispose(&id1).await.unwrap();

  let (id2, reused2) =
    client.create_runtime(base_options(), Some("n")).await.unwrap();
  assert!(reused2);
  assert_eq!(id1, id2);

  client
    .eval(&id2, "console.log(globalThis.x)", EvalOptions::default())
    .await
    .unwrap();
  assert_eq!(client.host().console_lines(), vec!["1"]);
}

#[tokio::test]
async fn active_namespace_is_busy() {
  let engine = ScriptEngine::new();
  let harness = start(&engine, 4).await;
  let client = harness.client().await;

  client.create_runtime(base_options(), Some("ns")).await.unwrap();
  let err =
    client.create_runtime(base_options(), Some("ns")).await.unwrap_err();
  assert_eq!(err.kind, ErrorKind::NamespaceBusy);
}

#[tokio::test]
async fn empty_namespace_id_is_a_valid_key() {
  let engine = ScriptEngine::new();
  let harness = start(&engine, 4).await;
  let client = harness.client().await;

  let (id1, _) =
    client.create_runtime(base_options(), Some("")).await.unwrap();
  client.dispose(&id1).await.unwrap();
  let (id2, reused) =
    client.create_runtime(base_options(), Some("")).await.unwrap();
  assert!(reused);
  assert_eq!(id1, id2);
}

#[tokio::test]
async fn eviction_discards_the_least_recently_disposed() {
  let engine = ScriptEngine::new();
  let harness = start(&engine, 3).await;
  let client = harness.client().await;

  for ns in ["ns1", "ns2", "ns3"] {
    let (id, _) =
      client.create_runtime(base_options(), Some(ns)).await.unwrap();
    client.dispose(&id).await.unwrap();
  }

  // Full: ns4 evicts ns1 (smallest disposedAt).
  let (id4, reused4) =
    client.create_runtime(base_options(), Some("ns4")).await.unwrap();
  assert!(!reused4);
  client.dispose(&id4).await.unwrap();

  // ns1 is gone, so this is a fresh construction (and evicts ns2).
  let (_, reused1) =
    client.create_runtime(base_options(), Some("ns1")).await.unwrap();
  assert!(!reused1);

  // ns3 was never evicted: reuse.
  let (_, reused3) =
    client.create_runtime(base_options(), Some("ns3")).await.unwrap();
  assert!(reused3);
}

#[tokio::test]
async fn capacity_exhausted_when_nothing_is_evictable() {
  let engine = ScriptEngine::new();
  let harness = start(&engine, 1).await;
  let client = harness.client().await;

  client.create_runtime(base_options(), Some("busy")).await.unwrap();
  let err = client.create_runtime(base_options(), None).await.unwrap_err();
  assert_eq!(err.kind, ErrorKind::CapacityExhausted);
}

#[tokio::test]
async fn connection_close_soft_disposes_namespaced_isolates() {
  let engine = ScriptEngine::new();
  engine.program(
    "globalThis.kept = 'still here'",
    vec![Step::SetGlobal(s("kept"), lit("still here".into()))],
  );
  engine.program(
    "console.log(globalThis.kept)",
    vec![log_args(vec![Expr::GlobalGet(s("kept"))])],
  );

  let harness = start(&engine, 4).await;

  let id1 = {
    let client = harness.client().await;
    let (id, _) =
      client.create_runtime(base_options(), Some("keep")).await.unwrap();
    client
      .eval(&id, "globalThis.kept = 'still here'", EvalOptions::default())
      .await
      .unwrap();
    client.close();
    id
  };
  tokio::time::sleep(Duration::from_millis(100)).await;

  let client = harness.client().await;
  let (id2, reused) =
    client.create_runtime(base_options(), Some("keep")).await.unwrap();
  assert!(reused);
  assert_eq!(id1, id2);
  client
    .eval(&id2, "console.log(globalThis.kept)", EvalOptions::default())
    .await
    .unwrap();
  assert_eq!(client.host().console_lines(), vec!["still here"]);
}

// ---------------------------------------------------------------------------
// Modules
// ---------------------------------------------------------------------------

fn loader_table(
  entries: &[(&str, &str, Option<&str>)],
) -> HashMap<String, (String, Option<String>)> {
  entries
    .iter()
    .map(|(spec, code, format)| {
      (s(spec), (s(code), format.map(str::to_string)))
    })
    .collect()
}

#[tokio::test]
async fn loader_fetches_each_module_once() {
  let engine = ScriptEngine::new();
  let harness = start(&engine, 4).await;
  let client = harness.client().await;
  client.host().set_loader_table(loader_table(&[(
    "./dep.js",
    "export const d = 1;",
    None,
  )]));

  let (id, _) = client.create_runtime(base_options(), None).await.unwrap();
  let code = "import './dep.js';";
  let options = EvalOptions {
    filename: Some(s("/main.js")),
    ..Default::default()
  };
  client.eval(&id, code, options.clone()).await.unwrap();
  client.eval(&id, code, options).await.unwrap();

  let calls = client.host().loader_calls.lock().clone();
  assert_eq!(calls, vec!["./dep.js"]);
}

#[tokio::test]
async fn cjs_export_star_chain_reaches_the_importer() {
  let engine = ScriptEngine::new();
  let entry = "import { deepValue } from \"A\";\nglobalThis.deep = deepValue;";
  engine.program(
    entry,
    vec![Step::SetGlobal(s("deep"), Expr::GetPath(s("A"), vec![s("deepValue")]))],
  );
  engine.program(
    "console.log(globalThis.deep)",
    vec![log_args(vec![Expr::GlobalGet(s("deep"))])],
  );

  let harness = start(&engine, 4).await;
  let client = harness.client().await;
  client.host().set_loader_table(loader_table(&[
    ("A", "__exportStar(require(\"B\"), exports);", Some("cjs")),
    ("B", "__exportStar(require(\"C\"), exports);", Some("cjs")),
    ("C", "export const deepValue = 'found-it';", None),
  ]));

  let (id, _) = client.create_runtime(base_options(), None).await.unwrap();
  client.eval(&id, entry, EvalOptions::default()).await.unwrap();
  client
    .eval(&id, "console.log(globalThis.deep)", EvalOptions::default())
    .await
    .unwrap();

  assert_eq!(client.host().console_lines(), vec!["found-it"]);
  let calls = client.host().loader_calls.lock().clone();
  assert_eq!(calls, vec!["A", "B", "C"]);
}

#[tokio::test]
async fn loader_override_beats_builtin_fallback() {
  let engine = ScriptEngine::new();
  let entry = "import { custom } from \"node:events\";\nglobalThis.ev = custom;";
  engine.program(
    entry,
    vec![Step::SetGlobal(
      s("ev"),
      Expr::GetPath(s("node:events"), vec![s("custom")]),
    )],
  );
  engine.program(
    "console.log(globalThis.ev)",
    vec![log_args(vec![Expr::GlobalGet(s("ev"))])],
  );

  let harness = start(&engine, 4).await;
  let client = harness.client().await;
  client.host().set_loader_table(loader_table(&[(
    "node:events",
    "export const custom = 'yes';",
    None,
  )]));

  let (id, _) = client.create_runtime(base_options(), None).await.unwrap();
  client.eval(&id, entry, EvalOptions::default()).await.unwrap();
  client
    .eval(&id, "console.log(globalThis.ev)", EvalOptions::default())
    .await
    .unwrap();
  assert_eq!(client.host().console_lines(), vec!["yes"]);
}

#[tokio::test]
async fn builtin_fallback_kicks_in_when_the_loader_rejects() {
  let engine = ScriptEngine::new();
  let harness = start(&engine, 4).await;
  let client = harness.client().await;
  // The loader knows nothing; node:* specifiers fall back in-isolate.
  client.host().set_loader_table(loader_table(&[]));

  let (id, _) = client.create_runtime(base_options(), None).await.unwrap();
  client
    .eval(&id, "import 'node:crypto';", EvalOptions::default())
    .await
    .unwrap();
  // The bare alias shares the cache entry: no second fallback, and the
  // loader saw both attempts.
  client.eval(&id, "import 'crypto';", EvalOptions::default()).await.unwrap();
  let calls = client.host().loader_calls.lock().clone();
  assert_eq!(calls, vec!["node:crypto", "crypto"]);
}

#[tokio::test]
async fn missing_loader_is_a_fixed_error() {
  let engine = ScriptEngine::new();
  let harness = start(&engine, 4).await;
  let client = harness.client().await;

  let mut options = base_options();
  options.capabilities.module_loader = false;
  let (id, _) = client.create_runtime(options, None).await.unwrap();
  let err = client
    .eval(&id, "import './x.js';", EvalOptions::default())
    .await
    .unwrap_err();
  assert_eq!(err.kind, ErrorKind::NoModuleLoader);
  assert_eq!(err.message, "No module loader registered");
}

#[tokio::test]
async fn syntax_errors_surface_with_the_record_filename() {
  let engine = ScriptEngine::new();
  let harness = start(&engine, 4).await;
  let client = harness.client().await;
  client.host().set_loader_table(loader_table(&[(
    "./bad.js",
    "%%syntax-error%%",
    None,
  )]));

  let (id, _) = client.create_runtime(base_options(), None).await.unwrap();
  let err = client
    .eval(&id, "import './bad.js';", EvalOptions::default())
    .await
    .unwrap_err();
  assert_eq!(err.kind, ErrorKind::Syntax);
  assert_eq!(err.name, "SyntaxError");
  assert!(err.stack.unwrap().contains("/src/bad.js"));
}

// ---------------------------------------------------------------------------
// Errors, timeouts, memory
// ---------------------------------------------------------------------------

#[tokio::test]
async fn thrown_errors_keep_name_and_message_across_the_bridge() {
  let engine = ScriptEngine::new();
  engine.program(
    "throw new TypeError('boom')",
    vec![Step::Throw { name: s("TypeError"), message: s("boom") }],
  );
  let harness = start(&engine, 4).await;
  let client = harness.client().await;

  let (id, _) = client.create_runtime(base_options(), None).await.unwrap();
  let err = client
    .eval(&id, "throw new TypeError('boom')", EvalOptions::default())
    .await
    .unwrap_err();
  assert_eq!(err.kind, ErrorKind::UserError);
  assert_eq!(err.name, "TypeError");
  assert_eq!(err.message, "boom");
}

#[tokio::test]
async fn timeout_faults_only_the_current_eval() {
  let engine = ScriptEngine::new();
  engine.program("while(true){}", vec![Step::BusyLoop]);
  let harness = start(&engine, 4).await;
  let client = harness.client().await;

  let (id, _) = client.create_runtime(base_options(), None).await.unwrap();
  let err = client
    .eval(
      &id,
      "while(true){}",
      EvalOptions { max_execution_ms: Some(100), ..Default::default() },
    )
    .await
    .unwrap_err();
  assert_eq!(err.kind, ErrorKind::Timeout);
  assert!(err.message.contains("Script execution timed out"));

  // The isolate stays usable.
  client.eval(&id, "1 + 1", EvalOptions::default()).await.unwrap();
}

#[tokio::test]
async fn oom_poisons_the_isolate_and_reuse_constructs_fresh() {
  let engine = ScriptEngine::new();
  engine.program("allocateTooMuch()", vec![Step::TriggerOom]);
  let harness = start(&engine, 4).await;
  let client = harness.client().await;

  let (id1, _) =
    client.create_runtime(base_options(), Some("m")).await.unwrap();
  let err = client
    .eval(&id1, "allocateTooMuch()", EvalOptions::default())
    .await
    .unwrap_err();
  assert_eq!(err.kind, ErrorKind::OutOfMemory);

  // Permanently unusable.
  let err =
    client.eval(&id1, "1 + 1", EvalOptions::default()).await.unwrap_err();
  assert_eq!(err.kind, ErrorKind::OutOfMemory);

  client.dispose(&id1).await.unwrap();
  let (id2, reused) =
    client.create_runtime(base_options(), Some("m")).await.unwrap();
  assert!(!reused);
  assert_ne!(id1, id2);
  client.eval(&id2, "1 + 1", EvalOptions::default()).await.unwrap();
}

// ---------------------------------------------------------------------------
// Console
// ---------------------------------------------------------------------------

#[tokio::test]
async fn console_entries_arrive_in_source_order() {
  let engine = ScriptEngine::new();
  engine.program(
    "console.log('a'); console.log('b'); console.count('c'); console.count('c');",
    vec![
      log_args(vec![lit("a".into())]),
      log_args(vec![lit("b".into())]),
      Step::CallOp {
        name: s("op_console_count"),
        args: vec![lit("c".into())],
        bind: None,
      },
      Step::CallOp {
        name: s("op_console_count"),
        args: vec![lit("c".into())],
        bind: None,
      },
    ],
  );
  let harness = start(&engine, 4).await;
  let client = harness.client().await;

  let (id, _) = client.create_runtime(base_options(), None).await.unwrap();
  client
    .eval(
      &id,
      "console.log('a'); console.log('b'); console.count('c'); console.count('c');",
      EvalOptions::default(),
    )
    .await
    .unwrap();
  assert_eq!(client.host().console_lines(), vec!["a", "b", "c: 1", "c: 2"]);
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

fn delta(text: &str) -> Value {
  Value::object([
    (s("type"), Value::String(s("text-delta"))),
    (s("text"), Value::String(s(text))),
  ])
}

#[tokio::test]
async fn custom_iterator_tees_and_survives_identity_transform() {
  let engine = ScriptEngine::new();
  let code = "const it = llmStream(); /* tee + identity + drain */";
  let read = |binding: &str, from: &str| Step::CallOp {
    name: s("op_stream_read"),
    args: vec![Expr::Get(s(from))],
    bind: Some(s(binding)),
  };
  let text_of = |b: &str| Expr::GetPath(s(b), vec![s("value"), s("text")]);
  engine.program(
    code,
    vec![
      Step::CallOp {
        name: s("op_custom_call"),
        args: vec![lit("llmStream".into())],
        bind: Some(s("it")),
      },
      Step::CallOp {
        name: s("op_stream_tee"),
        args: vec![Expr::Get(s("it"))],
        bind: Some(s("branches")),
      },
      Step::Bind(s("a"), Expr::IndexOf(s("branches"), 0)),
      Step::Bind(s("b"), Expr::IndexOf(s("branches"), 1)),
      Step::CallOp {
        name: s("op_stream_identity"),
        args: vec![Expr::Get(s("a"))],
        bind: Some(s("ta")),
      },
      read("r1", "ta"),
      read("r2", "ta"),
      read("r3", "ta"),
      read("r4", "ta"),
      read("r5", "ta"),
      read("s1", "b"),
      read("s2", "b"),
      read("s3", "b"),
      log_args(vec![text_of("r1"), text_of("r2"), text_of("r3")]),
      log_args(vec![Expr::GetPath(s("r4"), vec![s("value"), s("type")])]),
      log_args(vec![Expr::GetPath(s("r5"), vec![s("done")])]),
      log_args(vec![text_of("s1"), text_of("s2"), text_of("s3")]),
    ],
  );

  let harness = start(&engine, 4).await;
  let client = harness.client().await;
  client.host().set_custom("llmStream", |_args| {
    CustomReply::Stream(vec![
      Ok(delta("Hello")),
      Ok(delta(" ")),
      Ok(delta("World")),
      Ok(Value::object([(s("type"), Value::String(s("finish")))])),
    ])
  });

  let mut options = base_options();
  options.capabilities.custom_functions = vec![CustomFnSpec {
    name: s("llmStream"),
    mode: CustomFnMode::AsyncIterator,
  }];
  let (id, _) = client.create_runtime(options, None).await.unwrap();
  client.eval(&id, code, EvalOptions::default()).await.unwrap();

  assert_eq!(
    client.host().console_lines(),
    vec![
      // Three deltas, identical through the identity transform...
      "Hello   World",
      "finish",
      "true",
      // ...and the same chunks on the other tee branch.
      "Hello   World",
    ]
  );
}

#[tokio::test]
async fn fetch_round_trips_with_a_streamed_body() {
  let engine = ScriptEngine::new();
  let code = "const resp = await fetch('http://host/hello');";
  engine.program(
    code,
    vec![
      Step::CallOp {
        name: s("op_fetch"),
        args: vec![Expr::Object(vec![
          (s("method"), lit("GET".into())),
          (s("url"), lit("http://host/hello".into())),
          (s("headers"), Expr::Array(vec![])),
          (s("body"), lit(Value::Null)),
        ])],
        bind: Some(s("resp")),
      },
      Step::CallOp {
        name: s("op_stream_read"),
        args: vec![Expr::GetPath(s("resp"), vec![s("body")])],
        bind: Some(s("chunk")),
      },
      log_args(vec![Expr::GetPath(s("resp"), vec![s("status")])]),
      log_args(vec![Expr::GetPath(s("chunk"), vec![s("value")])]),
    ],
  );

  let harness = start(&engine, 4).await;
  let client = harness.client().await;
  client.host().set_fetch(|request| {
    assert_eq!(request.url, "http://host/hello");
    Ok((
      ResponseSpec {
        status: 200,
        status_text: s("OK"),
        headers: vec![(s("content-type"), s("text/plain"))],
        body: None,
      },
      Some(vec![Value::String(s("hello"))]),
    ))
  });

  let (id, _) = client.create_runtime(base_options(), None).await.unwrap();
  client.eval(&id, code, EvalOptions::default()).await.unwrap();
  assert_eq!(client.host().console_lines(), vec!["200", "hello"]);
}

// ---------------------------------------------------------------------------
// serve() & dispatchRequest
// ---------------------------------------------------------------------------

fn get(url: &str) -> RequestSpec {
  RequestSpec {
    method: s("GET"),
    url: s(url),
    headers: Vec::new(),
    body: None,
  }
}

#[tokio::test]
async fn dispatch_routes_to_the_registered_serve_handler() {
  let engine = ScriptEngine::new();
  engine.callback(
    7,
    vec![Step::Return(Expr::Object(vec![
      (s("status"), lit(Value::Number(200.0))),
      (s("statusText"), lit("OK".into())),
      (s("headers"), Expr::Array(vec![])),
      (s("body"), lit(Value::Null)),
    ]))],
  );
  engine.program(
    "serve({ fetch: handler })",
    vec![Step::CallOp {
      name: s("op_serve_register"),
      args: vec![lit(Value::CallbackRef(7))],
      bind: None,
    }],
  );

  let harness = start(&engine, 4).await;
  let client = harness.client().await;
  let (id, _) = client.create_runtime(base_options(), None).await.unwrap();
  client
    .eval(&id, "serve({ fetch: handler })", EvalOptions::default())
    .await
    .unwrap();

  let response = client.dispatch(&id, get("http://local/")).await.unwrap();
  assert_eq!(response.status, 200);
  assert_eq!(response.status_text, "OK");
}

#[tokio::test]
async fn handler_returning_undefined_is_no_response() {
  let engine = ScriptEngine::new();
  engine.callback(8, vec![Step::Return(lit(Value::Undefined))]);
  engine.program(
    "serve({ fetch: broken })",
    vec![Step::CallOp {
      name: s("op_serve_register"),
      args: vec![lit(Value::CallbackRef(8))],
      bind: None,
    }],
  );

  let harness = start(&engine, 4).await;
  let client = harness.client().await;
  let (id, _) = client.create_runtime(base_options(), None).await.unwrap();
  client
    .eval(&id, "serve({ fetch: broken })", EvalOptions::default())
    .await
    .unwrap();

  let err = client.dispatch(&id, get("http://local/")).await.unwrap_err();
  assert_eq!(err.kind, ErrorKind::NoResponse);
  assert_eq!(err.message, "fetch handler did not return a Response");
}

#[tokio::test]
async fn response_bodies_stream_back_to_the_client() {
  let engine = ScriptEngine::new();
  engine.callback(
    9,
    vec![
      Step::CallOp {
        name: s("op_readable_create"),
        args: vec![],
        bind: Some(s("rid")),
      },
      Step::CallOp {
        name: s("op_readable_push"),
        args: vec![Expr::Get(s("rid")), lit("hi".into())],
        bind: None,
      },
      Step::CallOp {
        name: s("op_readable_close"),
        args: vec![Expr::Get(s("rid"))],
        bind: None,
      },
      Step::Return(Expr::Object(vec![
        (s("status"), lit(Value::Number(200.0))),
        (s("statusText"), lit("OK".into())),
        (s("headers"), Expr::Array(vec![])),
        (s("body"), Expr::Get(s("rid"))),
      ])),
    ],
  );
  engine.program(
    "serve({ fetch: streaming })",
    vec![Step::CallOp {
      name: s("op_serve_register"),
      args: vec![lit(Value::CallbackRef(9))],
      bind: None,
    }],
  );

  let harness = start(&engine, 4).await;
  let client = harness.client().await;
  let (id, _) = client.create_runtime(base_options(), None).await.unwrap();
  client
    .eval(&id, "serve({ fetch: streaming })", EvalOptions::default())
    .await
    .unwrap();

  let response = client.dispatch(&id, get("http://local/body")).await.unwrap();
  let mut body = client.open_stream(response.body.expect("body handle"));
  let mut chunks = Vec::new();
  while let Some(chunk) = body.next().await {
    chunks.push(chunk.unwrap());
  }
  assert_eq!(chunks, vec![Value::String(s("hi"))]);
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timers_fire_in_monotonic_order() {
  let engine = ScriptEngine::new();
  let code = "setTimeout(() => console.log('late'), 20);";
  engine.program(
    code,
    vec![
      Step::CallOp {
        name: s("op_timer_start"),
        args: vec![lit(Value::Number(1.0)), lit(Value::Number(20.0))],
        bind: Some(s("fired")),
      },
      log_args(vec![Expr::Get(s("fired"))]),
    ],
  );
  let harness = start(&engine, 4).await;
  let client = harness.client().await;
  let (id, _) = client.create_runtime(base_options(), None).await.unwrap();
  client.eval(&id, code, EvalOptions::default()).await.unwrap();
  assert_eq!(client.host().console_lines(), vec!["true"]);
}

// ---------------------------------------------------------------------------
// Test environment
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_tests_collects_statuses() {
  let engine = ScriptEngine::new();
  engine.callback(21, vec![Step::Return(lit(Value::Null))]);
  engine.callback(
    22,
    vec![Step::Throw { name: s("Error"), message: s("expected 1 to be 2") }],
  );
  let register = |name: &str, callback: u64, mode: Option<&str>| {
    let mut fields = vec![
      (s("kind"), lit("test".into())),
      (s("name"), lit(name.into())),
      (s("suitePath"), Expr::Array(vec![])),
      (s("callback"), lit(Value::CallbackRef(callback))),
    ];
    if let Some(mode) = mode {
      fields.push((s("mode"), lit(mode.into())));
    }
    Step::CallOp {
      name: s("op_test_register"),
      args: vec![Expr::Object(fields)],
      bind: None,
    }
  };
  let code = "it('adds'); it('fails'); it.skip('later'); await runTests();";
  engine.program(
    code,
    vec![
      register("adds", 21, None),
      register("fails", 22, None),
      register("later", 21, Some("skip")),
      Step::CallOp {
        name: s("op_test_run"),
        args: vec![],
        bind: Some(s("report")),
      },
      log_args(vec![
        Expr::GetPath(s("report"), vec![s("passed")]),
        Expr::GetPath(s("report"), vec![s("failed")]),
        Expr::GetPath(s("report"), vec![s("skipped")]),
        Expr::GetPath(s("report"), vec![s("total")]),
      ]),
    ],
  );

  let harness = start(&engine, 4).await;
  let client = harness.client().await;
  let (id, _) = client.create_runtime(base_options(), None).await.unwrap();
  client.eval(&id, code, EvalOptions::default()).await.unwrap();
  assert_eq!(client.host().console_lines(), vec!["1 1 1 3"]);
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stats_count_isolates_requests_and_connections() {
  let engine = ScriptEngine::new();
  engine.callback(
    7,
    vec![Step::Return(Expr::Object(vec![
      (s("status"), lit(Value::Number(204.0))),
      (s("statusText"), lit("No Content".into())),
      (s("headers"), Expr::Array(vec![])),
      (s("body"), lit(Value::Null)),
    ]))],
  );
  engine.program(
    "serve({ fetch: handler })",
    vec![Step::CallOp {
      name: s("op_serve_register"),
      args: vec![lit(Value::CallbackRef(7))],
      bind: None,
    }],
  );

  let harness = start(&engine, 4).await;
  let client = harness.client().await;
  let (id, _) = client.create_runtime(base_options(), None).await.unwrap();
  client.create_runtime(base_options(), None).await.unwrap();
  client
    .eval(&id, "serve({ fetch: handler })", EvalOptions::default())
    .await
    .unwrap();
  client.dispatch(&id, get("http://local/")).await.unwrap();

  let stats = client.stats().await.unwrap();
  assert_eq!(stats.total_isolates_created, 2);
  assert_eq!(stats.total_requests_processed, 1);
  assert_eq!(stats.active_connections, 1);
}
