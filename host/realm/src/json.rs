//! Conversions between [`HostValue`]s and JSON text.

use std::rc::Rc;

use rustc_hash::FxHashSet;
use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::value::{HostValue, Obj, ObjectKind, PropertyKey};

#[derive(Debug, Clone, Error)]
pub enum JsonError {
    #[error("converting circular structure to JSON")]
    Cyclic,
}

/// Converts `value` to JSON. `None` means the value has no JSON representation at all (e.g. it is
/// `undefined` or a function).
pub fn to_json(value: &HostValue) -> Result<Option<Value>, JsonError> {
    Serializer::default().convert(value)
}

/// Serializes `value` to JSON text. Values without a representation produce empty text.
pub fn stringify(value: &HostValue) -> Result<String, JsonError> {
    Ok(to_json(value)?.map(|json| json.to_string()).unwrap_or_default())
}

#[derive(Default)]
struct Serializer {
    visiting: FxHashSet<*const ()>,
}

impl Serializer {
    fn convert(&mut self, value: &HostValue) -> Result<Option<Value>, JsonError> {
        Ok(Some(match value {
            HostValue::Undefined | HostValue::Symbol(_) => return Ok(None),
            HostValue::Null => Value::Null,
            HostValue::Bool(value) => Value::Bool(*value),
            HostValue::Number(value) => number(*value),
            HostValue::String(text) => Value::String(text.to_string()),
            HostValue::Object(obj) => return self.convert_object(obj),
        }))
    }

    fn convert_object(&mut self, obj: &Obj) -> Result<Option<Value>, JsonError> {
        if matches!(obj.kind(), ObjectKind::Function(_)) {
            return Ok(None);
        }

        let id = obj.as_ptr();
        if !self.visiting.insert(id) {
            return Err(JsonError::Cyclic);
        }

        let result = self.convert_members(obj);
        self.visiting.remove(&id);

        result.map(Some)
    }

    fn convert_members(&mut self, obj: &Obj) -> Result<Value, JsonError> {
        if let ObjectKind::Array(items) = obj.kind() {
            let items = items.borrow().clone();

            return items
                .iter()
                .map(|item| Ok(self.convert(item)?.unwrap_or(Value::Null)))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array);
        }

        let props = obj.props().clone();
        let mut map = Map::new();

        for (key, value) in &props {
            let PropertyKey::String(key) = key else {
                continue;
            };

            if let Some(value) = self.convert(value)? {
                map.insert(key.to_string(), value);
            }
        }

        Ok(Value::Object(map))
    }
}

fn number(value: f64) -> Value {
    const MAX_SAFE: f64 = 9_007_199_254_740_992.0;

    if value.fract() == 0.0 && value.abs() < MAX_SAFE {
        // Also folds `-0` into `0`.
        return Value::Number(Number::from(value as i64));
    }

    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

/// Builds host objects mirroring parsed JSON.
pub fn from_json(value: &Value) -> HostValue {
    match value {
        Value::Null => HostValue::Null,
        Value::Bool(value) => HostValue::Bool(*value),
        Value::Number(value) => HostValue::Number(value.as_f64().unwrap_or(f64::NAN)),
        Value::String(text) => HostValue::String(Rc::from(text.as_str())),
        Value::Array(items) => Obj::array(items.iter().map(from_json).collect()).into(),
        Value::Object(map) => {
            let obj = Obj::plain();
            for (key, value) in map {
                obj.set(PropertyKey::from(key.as_str()), from_json(value));
            }
            obj.into()
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::value::{HostFunction, Symbol};

    fn noop(
        _: &mut dyn crate::call::Scope,
        _: &HostValue,
        _: &[HostValue],
    ) -> anyhow::Result<crate::call::Completion> {
        Ok(Ok(HostValue::Undefined))
    }

    #[test]
    fn objects_keep_insertion_order_and_skip_unrepresentable_members() {
        let obj = Obj::plain();
        obj.set("b".into(), 1.0.into());
        obj.set("a".into(), "x".into());
        obj.set("gone".into(), HostValue::Undefined);
        obj.set(
            "f".into(),
            Obj::function(HostFunction::Native {
                name: "noop",
                method: noop,
            })
            .into(),
        );
        obj.set(PropertyKey::Symbol(Symbol::new("s")), true.into());

        assert_eq!(stringify(&obj.into()).unwrap(), r#"{"b":1,"a":"x"}"#);
    }

    #[test]
    fn arrays_turn_holes_into_null() {
        let array = Obj::array(vec![
            HostValue::Undefined,
            1.5.into(),
            HostValue::Symbol(Symbol::new("s")),
            f64::NAN.into(),
        ]);

        assert_eq!(stringify(&array.into()).unwrap(), "[null,1.5,null,null]");
    }

    #[test]
    fn top_level_undefined_is_empty() {
        assert_eq!(stringify(&HostValue::Undefined).unwrap(), "");
    }

    #[test]
    fn cycles_are_detected() {
        let obj = Obj::plain();
        obj.set("self".into(), obj.clone().into());

        assert!(matches!(to_json(&obj.into()), Err(JsonError::Cyclic)));
    }

    #[test]
    fn shared_children_are_not_cycles() {
        let child = Obj::plain();
        let parent = Obj::array(vec![child.clone().into(), child.into()]);

        assert_eq!(stringify(&parent.into()).unwrap(), "[{},{}]");
    }

    #[test]
    fn parsed_json_becomes_host_objects() {
        let value = from_json(&json!({ "temp": 21.5, "tags": ["a", null] }));
        let obj = value.as_object().unwrap();

        assert_eq!(obj.get_str("temp"), Some(21.5.into()));

        let tags = obj.get_str("tags").unwrap();
        let tags = tags.as_object().unwrap();
        assert_eq!(tags.get_str("0"), Some("a".into()));
        assert_eq!(tags.get_str("1"), Some(HostValue::Null));
    }
}
