//! JSON <-> JavaScript value conversions
//!
//! Used to inject configuration-provided globals into a sandbox and to format
//! structured console arguments.
//!
//! | JSON Type | JavaScript Type |
//! |-----------|-----------------|
//! | null | null |
//! | boolean | Boolean |
//! | number | Number |
//! | string | String |
//! | array | Array |
//! | object | Object |
//!
//! Symbol keys are skipped and symbols convert to `null`. Functions convert
//! to `null` as well, matching `JSON.stringify` inside arrays.

use boa_engine::{
    error::JsNativeErrorKind,
    object::{builtins::JsArray, JsObject},
    property::PropertyKey,
    value::JsValue,
    Context, JsError, JsString,
};
use rendergate_common::{RenderError, Result};
use serde_json::Value as JsonValue;

/// Nesting bound for [`js_value_to_json`]; deeper values (and cycles) become
/// the string `"[Circular]"`.
const MAX_DEPTH: usize = 32;

pub fn json_to_js_value(json: JsonValue, ctx: &mut Context) -> Result<JsValue> {
    match json {
        JsonValue::Null => Ok(JsValue::null()),
        JsonValue::Bool(b) => Ok(JsValue::new(b)),
        JsonValue::Number(n) => n
            .as_f64()
            .map(JsValue::new)
            .ok_or_else(|| RenderError::InvalidInput("Number out of range".into())),
        JsonValue::String(s) => Ok(JsValue::new(JsString::from(s.as_str()))),
        JsonValue::Array(items) => {
            let array = JsArray::new(ctx);
            for (i, item) in items.into_iter().enumerate() {
                let value = json_to_js_value(item, ctx)?;
                array.push(value, ctx).map_err(|e| {
                    RenderError::ScriptExecution(format!("Failed to push array element {}: {}", i, e))
                })?;
            }
            Ok(array.into())
        }
        JsonValue::Object(map) => {
            let object = JsObject::with_object_proto(ctx.intrinsics());
            for (key, value) in map {
                let value = json_to_js_value(value, ctx)?;
                object
                    .create_data_property_or_throw(JsString::from(key.as_str()), value, ctx)
                    .map_err(|e| {
                        RenderError::ScriptExecution(format!("Failed to set property '{}': {}", key, e))
                    })?;
            }
            Ok(object.into())
        }
    }
}

pub fn js_value_to_json(value: &JsValue, ctx: &mut Context) -> Result<JsonValue> {
    to_json(value, ctx, 0)
}

fn to_json(value: &JsValue, ctx: &mut Context, depth: usize) -> Result<JsonValue> {
    if value.is_undefined() || value.is_null() || value.is_symbol() || value.is_callable() {
        return Ok(JsonValue::Null);
    }
    if let Some(b) = value.as_boolean() {
        return Ok(JsonValue::Bool(b));
    }
    if let Some(n) = value.as_number() {
        if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
            return Ok(JsonValue::Number((n as i64).into()));
        }
        return Ok(serde_json::Number::from_f64(n)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null));
    }
    if let Some(s) = value.as_string() {
        return Ok(JsonValue::String(s.to_std_string_escaped()));
    }

    let object = match value.as_object() {
        Some(object) => object.clone(),
        None => return Ok(JsonValue::Null),
    };
    if depth >= MAX_DEPTH {
        return Ok(JsonValue::String("[Circular]".into()));
    }

    if object.is_array() {
        let array = JsArray::from_object(object)
            .map_err(|e| RenderError::ScriptExecution(format!("Object is not a valid array: {}", e)))?;
        let length = array
            .length(ctx)
            .map_err(|e| RenderError::ScriptExecution(format!("Failed to get array length: {}", e)))?;

        let mut items = Vec::with_capacity(length.min(1024) as usize);
        for i in 0..length {
            let item = array
                .get(i, ctx)
                .map_err(|e| RenderError::ScriptExecution(format!("Failed to get element {}: {}", i, e)))?;
            items.push(to_json(&item, ctx, depth + 1)?);
        }
        return Ok(JsonValue::Array(items));
    }

    let keys = object
        .own_property_keys(ctx)
        .map_err(|e| RenderError::ScriptExecution(format!("Failed to get object keys: {}", e)))?;

    let mut map = serde_json::Map::new();
    for key in keys {
        let name = match &key {
            PropertyKey::String(s) => s.to_std_string_escaped(),
            PropertyKey::Index(i) => i.get().to_string(),
            PropertyKey::Symbol(_) => continue,
        };
        let property = object
            .get(key.clone(), ctx)
            .map_err(|e| RenderError::ScriptExecution(format!("Failed to get property '{}': {}", name, e)))?;
        if property.is_undefined() || property.is_callable() {
            continue;
        }
        map.insert(name, to_json(&property, ctx, depth + 1)?);
    }
    Ok(JsonValue::Object(map))
}

/// `name: message` for error-like objects (anything with a string `message`).
fn describe_error_object(object: &JsObject, ctx: &mut Context) -> Option<String> {
    let message = object.get(JsString::from("message"), ctx).ok()?;
    let message = message.as_string()?.to_std_string_escaped();
    let name = object
        .get(JsString::from("name"), ctx)
        .ok()
        .and_then(|v| v.as_string().map(|s| s.to_std_string_escaped()))
        .unwrap_or_default();
    if name.is_empty() {
        Some(message)
    } else {
        Some(format!("{}: {}", name, message))
    }
}

/// Renders a thrown value the way a console would, e.g. `TypeError: x is not a function`.
pub fn describe_js_error(error: &JsError, ctx: &mut Context) -> String {
    // Engine limit errors have no script-visible form.
    if is_runtime_limit(error) {
        return error.to_string();
    }
    let value = error.to_opaque(ctx);
    if let Some(object) = value.as_object() {
        let object = object.clone();
        if let Some(described) = describe_error_object(&object, ctx) {
            return described;
        }
    }
    match value.to_string(ctx) {
        Ok(s) => s.to_std_string_escaped(),
        Err(_) => error.to_string(),
    }
}

/// Whether `error` was raised by the engine's loop or recursion limits.
pub fn is_runtime_limit(error: &JsError) -> bool {
    error
        .as_native()
        .is_some_and(|native| matches!(native.kind, JsNativeErrorKind::RuntimeLimit))
}

/// Formats console arguments: strings verbatim, everything else as JSON.
pub fn format_console_args(args: &[JsValue], ctx: &mut Context) -> String {
    let mut parts = Vec::with_capacity(args.len());
    for arg in args {
        if let Some(s) = arg.as_string() {
            parts.push(s.to_std_string_escaped());
            continue;
        }
        if arg.is_undefined() {
            parts.push("undefined".to_string());
            continue;
        }
        if let Some(object) = arg.as_object() {
            let object = object.clone();
            if let Some(described) = describe_error_object(&object, ctx) {
                parts.push(described);
                continue;
            }
        }
        let text = match js_value_to_json(arg, ctx) {
            Ok(json) if !json.is_string() => json.to_string(),
            Ok(JsonValue::String(s)) => s,
            _ => arg
                .to_string(ctx)
                .map(|s| s.to_std_string_escaped())
                .unwrap_or_else(|_| "[unprintable]".to_string()),
        };
        parts.push(text);
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use boa_engine::Source;
    use serde_json::json;

    #[test]
    fn test_json_round_trip_through_js() {
        let mut ctx = Context::default();
        let original = json!({"name": "test", "items": [1, 2, 3], "nested": {"ok": true}, "none": null});
        let value = json_to_js_value(original.clone(), &mut ctx).unwrap();
        assert_eq!(js_value_to_json(&value, &mut ctx).unwrap(), original);
    }

    #[test]
    fn test_functions_and_undefined_are_skipped() {
        let mut ctx = Context::default();
        let value = ctx
            .eval(Source::from_bytes("({ a: 1, f: function () {}, u: undefined, s: 'x' })"))
            .unwrap();
        assert_eq!(js_value_to_json(&value, &mut ctx).unwrap(), json!({"a": 1, "s": "x"}));
    }

    #[test]
    fn test_cycles_are_bounded() {
        let mut ctx = Context::default();
        let value = ctx
            .eval(Source::from_bytes("const o = { name: 'loop' }; o.self = o; o"))
            .unwrap();
        let json = js_value_to_json(&value, &mut ctx).unwrap();
        assert_eq!(json["name"], "loop");
    }

    #[test]
    fn test_describe_error() {
        let mut ctx = Context::default();
        let error = ctx
            .eval(Source::from_bytes("throw new TypeError('bad thing')"))
            .unwrap_err();
        assert_eq!(describe_js_error(&error, &mut ctx), "TypeError: bad thing");

        let error = ctx.eval(Source::from_bytes("throw 'plain'")).unwrap_err();
        assert_eq!(describe_js_error(&error, &mut ctx), "plain");
    }

    #[test]
    fn test_format_console_args() {
        let mut ctx = Context::default();
        let args = [
            JsValue::new(JsString::from("count:")),
            JsValue::new(3),
            json_to_js_value(json!({"k": "v"}), &mut ctx).unwrap(),
        ];
        assert_eq!(format_console_args(&args, &mut ctx), r#"count: 3 {"k":"v"}"#);
    }
}
