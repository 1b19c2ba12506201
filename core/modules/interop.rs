// Copyright 2024-2026 the jsbox authors. MIT license.

//! CommonJS ⇄ ES module interop rules, expressed over the tagged value
//! model. The engine's CJS glue and the graph's facade construction both go
//! through these functions so the semantics live in exactly one place.

use crate::value::Object;
use crate::value::Value;

/// JavaScript truthiness, as far as the value model can express it.
pub fn truthy(v: &Value) -> bool {
  match v {
    Value::Undefined | Value::Null => false,
    Value::Bool(b) => *b,
    Value::Number(n) => *n != 0.0 && !n.is_nan(),
    Value::String(s) => !s.is_empty(),
    _ => true,
  }
}

/// The `__exportStar(required, exports)` helper available in every CommonJS
/// scope: copies own enumerable properties except `default` and
/// `__esModule`, preserving keys that already exist (first write wins per
/// evaluation phase) so the outer module can supplement with locals.
pub fn export_star(required: &Value, exports: &mut Object) {
  let Some(src) = required.as_object() else {
    return;
  };
  for (key, value) in src {
    if key == "default" || key == "__esModule" {
      continue;
    }
    if !exports.contains_key(key) {
      exports.insert(key.clone(), value.clone());
    }
  }
}

/// Builds the ES namespace facade for an evaluated CommonJS module.
///
/// The final `module.exports` value becomes `default`; a plain object also
/// contributes each own string-keyed property as a named export. A truthy
/// `__esModule` marker means the module was transpiled from ESM, so its
/// `default` property *is* the default export rather than the whole object.
pub fn cjs_namespace(exports: &Value) -> Value {
  let mut ns = Object::new();
  if let Value::Object(obj) = exports {
    let es_module =
      obj.get("__esModule").map(truthy).unwrap_or(false);
    for (key, value) in obj {
      if key == "__esModule" || key == "default" {
        continue;
      }
      ns.insert(key.clone(), value.clone());
    }
    let default = if es_module {
      obj.get("default").cloned().unwrap_or(Value::Undefined)
    } else {
      exports.clone()
    };
    ns.insert("default".to_string(), default);
  } else {
    ns.insert("default".to_string(), exports.clone());
  }
  Value::Object(ns)
}
