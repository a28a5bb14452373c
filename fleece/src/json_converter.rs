// Drives an `Encoder` from a `serde_json::Value` tree. In the source
// system this role sits atop a streaming JSON tokenizer; here
// `serde_json` already hands us a parsed tree, so the converter is a
// straightforward recursive walk rather than an event-driven SAX loop.

use fleece_base::Result;

use crate::encoder::Encoder;

pub struct JSONConverter;

impl JSONConverter {
    /// Feeds `json` into `enc` as a single value's worth of write events.
    pub fn convert(json: &serde_json::Value, enc: &mut Encoder) -> Result<()> {
        match json {
            serde_json::Value::Null => enc.write_null(),
            serde_json::Value::Bool(b) => enc.write_bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    enc.write_int(i)
                } else if let Some(u) = n.as_u64() {
                    enc.write_unsigned(u)
                } else {
                    enc.write_double(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => enc.write_string(s),
            serde_json::Value::Array(items) => {
                enc.begin_array(Some(items.len()))?;
                for item in items {
                    Self::convert(item, enc)?;
                }
                enc.end_array()
            }
            serde_json::Value::Object(map) => {
                enc.begin_dict(Some(map.len()))?;
                for (k, v) in map {
                    enc.write_key(k)?;
                    Self::convert(v, enc)?;
                }
                enc.end_dict()
            }
        }
    }

    /// Parses `text` as JSON and encodes it in one step.
    pub fn encode_json_text(text: &str, options: crate::encoder::EncoderOptions) -> Result<Vec<u8>> {
        let json: serde_json::Value =
            serde_json::from_str(text).map_err(|e| fleece_base::err(fleece_base::ErrorKind::JSONError, e.to_string()))?;
        let mut enc = Encoder::new(options);
        Self::convert(&json, &mut enc)?;
        enc.extract_output()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::encoder::EncoderOptions;
    use crate::value::Value;
    use test_log::test;

    #[test]
    fn test_convert_nested_structure() {
        let buf = JSONConverter::encode_json_text(
            r#"{"name":"Jo","age":30,"tags":["a","b"],"active":true,"note":null}"#,
            EncoderOptions {
                sort_keys: true,
                ..Default::default()
            },
        )
        .unwrap();
        let root = Value::from_data(&buf).unwrap();
        let d = root.as_dict();
        assert_eq!(d.get("name").unwrap().as_string(), "Jo");
        assert_eq!(d.get("age").unwrap().as_int(), 30);
        assert_eq!(d.get("tags").unwrap().as_array().count(), 2);
        assert!(d.get("active").unwrap().as_bool());
        assert_eq!(d.get("note").unwrap().value_type(), crate::value::ValueType::Null);
    }

    #[test]
    fn test_convert_then_json_round_trip() {
        let text = r#"{"a":1,"b":[1,2,3]}"#;
        let buf = JSONConverter::encode_json_text(
            text,
            EncoderOptions {
                sort_keys: true,
                ..Default::default()
            },
        )
        .unwrap();
        let root = Value::from_data(&buf).unwrap();
        assert_eq!(root.to_json_string(), r#"{"a":1,"b":[1,2,3]}"#);
    }

    #[test]
    fn test_bad_json_is_an_error() {
        assert!(JSONConverter::encode_json_text("{not json", EncoderOptions::default()).is_err());
    }
}
