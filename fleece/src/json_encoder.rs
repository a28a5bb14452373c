// Renders an already-decoded `Value` tree as JSON text. Unlike `Encoder`,
// this isn't an event-driven builder over a flat buffer; it's a direct
// recursive walk (the input is already fully structured), matching the
// original JSONEncoder's role as a pretty-printer rather than a codec.

use base64::Engine;

use fleece_base::{err, ErrorKind, Result};

use crate::shared_keys::SharedKeys;
use crate::value::{Value, ValueType};

#[derive(Debug, Clone)]
pub struct JSONOptions {
    /// Sort dict keys and use Rust's shortest-round-trip float formatting,
    /// so two structurally-equal values always render identically.
    pub canonical: bool,
    /// Emit unquoted identifier keys and trailing commas (JSON5).
    pub json5: bool,
}

impl Default for JSONOptions {
    fn default() -> Self {
        JSONOptions {
            canonical: false,
            json5: false,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Container {
    Array,
    Dict,
}

pub struct JSONEncoder {
    out: String,
    opts: JSONOptions,
    commas: Vec<(Container, bool)>,
    suppress_comma: bool,
}

impl JSONEncoder {
    pub fn new(opts: JSONOptions) -> Self {
        JSONEncoder {
            out: String::new(),
            opts,
            commas: Vec::new(),
            suppress_comma: false,
        }
    }

    fn comma_if_needed(&mut self) {
        if self.suppress_comma {
            self.suppress_comma = false;
            return;
        }
        if let Some((_, has_item)) = self.commas.last_mut() {
            if *has_item {
                self.out.push(',');
            } else {
                *has_item = true;
            }
        }
    }

    // ---- event-driven building: the same write-event grammar Encoder
    // accepts (scalars, begin/end array, begin/end dict, key), so this
    // type can be used as an alternate sink in place of Encoder to
    // produce JSON text directly from a stream of events instead of
    // building a Fleece buffer first. ----

    pub fn write_null(&mut self) {
        self.comma_if_needed();
        self.out.push_str("null");
    }

    pub fn write_bool(&mut self, b: bool) {
        self.comma_if_needed();
        self.out.push_str(if b { "true" } else { "false" });
    }

    pub fn write_int(&mut self, v: i64) {
        self.comma_if_needed();
        self.out.push_str(&v.to_string());
    }

    pub fn write_uint(&mut self, v: u64) {
        self.comma_if_needed();
        self.out.push_str(&v.to_string());
    }

    pub fn write_double(&mut self, v: f64) {
        self.comma_if_needed();
        self.write_double_inner(v, 17);
    }

    pub fn write_float(&mut self, v: f32) {
        self.comma_if_needed();
        self.write_double_inner(v as f64, 6);
    }

    fn write_json_key_text(&mut self, key: &str) {
        if self.opts.json5 && is_json5_identifier(key) {
            self.out.push_str(key);
        } else {
            self.write_json_string(key);
        }
    }

    pub fn write_string(&mut self, s: &str) {
        self.comma_if_needed();
        self.write_json_string(s);
    }

    pub fn write_data(&mut self, data: &[u8]) {
        self.comma_if_needed();
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        self.write_json_string(&encoded);
    }

    pub fn begin_array(&mut self) {
        self.comma_if_needed();
        self.out.push('[');
        self.commas.push((Container::Array, false));
    }

    pub fn end_array(&mut self) -> Result<()> {
        match self.commas.pop() {
            Some((Container::Array, _)) => {}
            Some((Container::Dict, _)) => {
                return Err(err(ErrorKind::EncodeError, "end_array called on an open dict"));
            }
            None => return Err(err(ErrorKind::EncodeError, "end_array without a matching begin_array")),
        }
        self.out.push(']');
        Ok(())
    }

    pub fn begin_dict(&mut self) {
        self.comma_if_needed();
        self.out.push('{');
        self.commas.push((Container::Dict, false));
    }

    pub fn write_key(&mut self, key: &str) {
        self.comma_if_needed();
        self.write_json_key_text(key);
        self.out.push(':');
        self.suppress_comma = true;
    }

    pub fn end_dict(&mut self) -> Result<()> {
        match self.commas.pop() {
            Some((Container::Dict, _)) => {}
            Some((Container::Array, _)) => {
                return Err(err(ErrorKind::EncodeError, "end_dict called on an open array"));
            }
            None => return Err(err(ErrorKind::EncodeError, "end_dict without a matching begin_dict")),
        }
        self.out.push('}');
        Ok(())
    }

    pub fn write_value(&mut self, v: &Value, sk: Option<&SharedKeys>) {
        self.comma_if_needed();
        match v.value_type() {
            ValueType::Null | ValueType::Undefined => self.out.push_str("null"),
            ValueType::Bool => self.out.push_str(if v.as_bool() { "true" } else { "false" }),
            ValueType::Int => self.out.push_str(&v.as_int().to_string()),
            ValueType::Double => {
                let precision = if v.is_float32() { 6 } else { 17 };
                self.write_double_inner(v.as_double(), precision);
            }
            ValueType::String => self.write_json_string(v.as_string()),
            ValueType::Blob => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(v.as_data());
                self.write_json_string(&encoded);
            }
            ValueType::Array => {
                self.out.push('[');
                self.commas.push((Container::Array, false));
                for item in v.as_array().iter() {
                    self.write_value(&item, sk);
                }
                self.commas.pop();
                self.out.push(']');
            }
            ValueType::Dict => {
                self.out.push('{');
                self.commas.push((Container::Dict, false));
                let mut entries: Vec<_> = v.as_dict().iter(sk).collect();
                if self.opts.canonical {
                    entries.sort_by(|a, b| a.key_string(sk).cmp(&b.key_string(sk)));
                }
                for e in entries {
                    self.comma_if_needed();
                    self.write_json_key_text(&e.key_string(sk).unwrap_or_default());
                    self.out.push(':');
                    self.suppress_comma = true;
                    self.write_value(&e.value, sk);
                }
                self.commas.pop();
                self.out.push('}');
            }
        }
    }

    /// `precision` is the number of significant digits to use in
    /// non-canonical mode: 6 for a value that originated as f32, 17 for
    /// f64, matching the width needed to round-trip each (canonical mode
    /// ignores it and always uses the shortest round-trip form).
    fn write_double_inner(&mut self, v: f64, precision: usize) {
        if v.is_nan() {
            self.out.push_str("null");
            return;
        }
        if v.is_infinite() {
            self.out.push_str(if v > 0.0 { "1e999" } else { "-1e999" });
            return;
        }
        if self.opts.canonical {
            // Shortest round-trip representation; guarantees structurally
            // equal documents always render byte-identical text.
            let s = format!("{}", v);
            self.out.push_str(&s);
        } else {
            self.out.push_str(&format_g(v, precision));
        }
    }

    fn write_json_string(&mut self, s: &str) {
        self.out.push('"');
        for c in s.chars() {
            match c {
                '"' => self.out.push_str("\\\""),
                '\\' => self.out.push_str("\\\\"),
                '\n' => self.out.push_str("\\n"),
                '\r' => self.out.push_str("\\r"),
                '\t' => self.out.push_str("\\t"),
                c if (c as u32) < 0x20 => {
                    self.out.push_str(&format!("\\u{:04x}", c as u32));
                }
                c => self.out.push(c),
            }
        }
        self.out.push('"');
    }

    pub fn finish_string(self) -> Result<String> {
        if !self.commas.is_empty() {
            return Err(err(ErrorKind::InternalError, "JSON encoder has unclosed containers"));
        }
        Ok(self.out)
    }
}

/// Whether `s` matches `[A-Za-z_$][A-Za-z_$0-9]*`, i.e. can be emitted as
/// an unquoted JSON5 object key.
fn is_json5_identifier(s: &str) -> bool {
    let bytes = s.as_bytes();
    match bytes.first() {
        Some(&b) if b.is_ascii_alphabetic() || b == b'_' || b == b'$' => {}
        _ => return false,
    }
    bytes[1..]
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || b == b'_' || b == b'$')
}

/// A `%.*g`-style formatter: `precision` significant digits, fixed-point
/// for "ordinary" magnitudes and scientific notation outside them, with
/// trailing zeros trimmed. Used for non-canonical float rendering to
/// match the source format's legacy text output.
fn format_g(v: f64, precision: usize) -> String {
    if v == 0.0 {
        return if v.is_sign_negative() { "-0".to_string() } else { "0".to_string() };
    }
    let precision = precision.max(1);
    let exp = v.abs().log10().floor() as i32;
    if exp < -4 || exp >= precision as i32 {
        let s = format!("{:.*e}", precision - 1, v);
        trim_scientific(&s)
    } else {
        let decimals = (precision as i32 - 1 - exp).max(0) as usize;
        let s = format!("{:.*}", decimals, v);
        trim_fixed(&s)
    }
}

fn trim_fixed(s: &str) -> String {
    if !s.contains('.') {
        return s.to_string();
    }
    let t = s.trim_end_matches('0');
    t.trim_end_matches('.').to_string()
}

fn trim_scientific(s: &str) -> String {
    match s.find('e') {
        Some(epos) => {
            let (mantissa, exp) = s.split_at(epos);
            format!("{}e{}", trim_fixed(mantissa), &exp[1..])
        }
        None => s.to_string(),
    }
}
