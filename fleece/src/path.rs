// Parses a path expression ("foo.bar[-1].baz", optionally "$"-prefixed)
// into a reusable sequence of steps, and separately evaluates RFC 6901
// JSON Pointers. Grounded closely on the original `Path::forEachComponent`
// / `Path::evalJSONPointer` state machine: a single pass over the
// specifier using a cursor, dispatching on whether the next component is
// introduced by `.` or `[`.

use fleece_base::{err, ErrorKind, Result};

use crate::shared_keys::SharedKeys;
use crate::slice::Slice;
use crate::value::{Value, ValueType};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Element {
    Key(String),
    Index(i32),
}

/// A parsed, reusable path expression.
#[derive(Debug, Clone)]
pub struct Path {
    elements: Vec<Element>,
}

/// Scans one path expression, invoking `f(token, component, index)` for
/// each step (`token` is `.` or `[`; `index` is only meaningful when
/// `token == '['`). Accepts a leading `$` as a no-op root marker.
fn for_each_component(spec: &str, mut f: impl FnMut(char, &str, i32) -> Result<bool>) -> Result<()> {
    if spec.is_empty() {
        return Err(err(ErrorKind::PathSyntaxError, "empty path"));
    }
    let mut s = Slice::from(spec);
    let mut token = s.peek_byte().unwrap();
    if token == b'$' {
        s.move_start(1);
        if s.is_empty() {
            return Ok(()); // "$" alone means the root
        }
        token = s.read_byte().unwrap();
        if token != b'.' && token != b'[' {
            return Err(err(ErrorKind::PathSyntaxError, "invalid path delimiter after $"));
        }
    } else if token == b'[' || token == b'.' {
        s.move_start(1);
    } else {
        token = b'.';
    }

    if s.is_empty() && token == b'.' {
        return Ok(()); // "" or "." mean the root
    }

    loop {
        let (param, index, next_rel): (String, i32, usize);
        if token == b'.' {
            let end = s.find_any_of_or_end(b".[");
            param = std::str::from_utf8(&s.as_bytes()[..end])
                .map_err(|_| err(ErrorKind::PathSyntaxError, "non-utf8 path component"))?
                .to_string();
            index = 0;
            next_rel = end;
        } else if token == b'[' {
            let end = s.find_byte(b']').ok_or_else(|| err(ErrorKind::PathSyntaxError, "missing ']'"))?;
            let raw = &s.as_bytes()[..end];
            let mut n = Slice::new(raw);
            let i = n
                .read_signed_decimal()
                .ok_or_else(|| err(ErrorKind::PathSyntaxError, "invalid array index"))?;
            if !n.is_empty() || !(i32::MIN as i64..=i32::MAX as i64).contains(&i) {
                return Err(err(ErrorKind::PathSyntaxError, "invalid array index"));
            }
            param = std::str::from_utf8(raw).unwrap_or("").to_string();
            index = i as i32;
            next_rel = end + 1; // skip the ']'
        } else {
            return Err(err(ErrorKind::PathSyntaxError, "invalid path component"));
        }

        if param.is_empty() {
            return Err(err(ErrorKind::PathSyntaxError, "empty property or index"));
        }
        if !f(token as char, &param, index)? {
            return Ok(());
        }

        if next_rel >= s.len() {
            break;
        }
        token = s.as_bytes()[next_rel];
        s.set_start(next_rel + 1);
    }
    Ok(())
}

impl Path {
    pub fn new(specifier: &str) -> Result<Path> {
        let mut elements = Vec::new();
        for_each_component(specifier, |token, component, index| {
            if token == '.' {
                elements.push(Element::Key(component.to_string()));
            } else {
                elements.push(Element::Index(index));
            }
            Ok(true)
        })?;
        Ok(Path { elements })
    }

    fn get_from_array<'a>(item: Value<'a>, index: i32) -> Option<Value<'a>> {
        let a = item.as_array();
        let idx = if index < 0 {
            let count = a.count();
            if (-index) as u32 > count {
                return None;
            }
            (index + count as i32) as u32
        } else {
            index as u32
        };
        a.get(idx)
    }

    pub fn eval<'a>(&self, root: Value<'a>, sk: Option<&SharedKeys>) -> Option<Value<'a>> {
        let mut item = root;
        for e in &self.elements {
            item = match e {
                Element::Key(k) => item.as_dict().get_opt(k, sk)?,
                Element::Index(i) => Self::get_from_array(item, *i)?,
            };
        }
        Some(item)
    }

    /// Parses and evaluates `specifier` in one step, without retaining a
    /// reusable `Path`.
    pub fn eval_str<'a>(specifier: &str, root: Value<'a>, sk: Option<&SharedKeys>) -> Result<Option<Value<'a>>> {
        Path::new(specifier).map(|p| p.eval(root, sk))
    }

    /// Evaluates an RFC 6901 JSON Pointer (always absolute: starts with
    /// `/`) against `root`.
    pub fn eval_json_pointer<'a>(specifier: &str, root: Value<'a>, sk: Option<&SharedKeys>) -> Result<Option<Value<'a>>> {
        let mut s = Slice::from(specifier);
        if s.read_byte() != Some(b'/') {
            return Err(err(ErrorKind::PathSyntaxError, "JSONPointer does not start with '/'"));
        }
        let mut current = Some(root);
        while !s.is_empty() {
            let Some(cur) = current else { return Ok(None) };
            let slash = s.find_byte_or_end(b'/');
            let raw = std::str::from_utf8(&s.as_bytes()[..slash]).unwrap_or("");
            let token = unescape_token(raw);

            current = match cur.value_type() {
                ValueType::Array => {
                    let mut n = Slice::from(token.as_str());
                    match n.read_decimal() {
                        Some(i) if n.is_empty() && i <= i32::MAX as u64 => cur.as_array().get(i as u32),
                        _ => return Err(err(ErrorKind::PathSyntaxError, "invalid array index in JSON pointer")),
                    }
                }
                ValueType::Dict => cur.as_dict().get_opt(&token, sk),
                _ => None,
            };

            if slash >= s.len() {
                break;
            }
            s.set_start(slash + 1);
        }
        Ok(current)
    }
}

/// Decodes one JSON Pointer reference-token: `~1` -> `/`, `~0` -> `~`.
pub(crate) fn unescape_token(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '~' {
            match chars.next() {
                Some('0') => out.push('~'),
                Some('1') => out.push('/'),
                Some(other) => {
                    out.push('~');
                    out.push(other);
                }
                None => out.push('~'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Encodes one JSON Pointer reference-token: `~` -> `~0`, `/` -> `~1`.
pub(crate) fn escape_token(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '~' => out.push_str("~0"),
            '/' => out.push_str("~1"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::encoder::{Encoder, EncoderOptions};
    use test_log::test;

    fn sample() -> Vec<u8> {
        let mut enc = Encoder::new(EncoderOptions {
            sort_keys: true,
            ..Default::default()
        });
        enc.begin_dict(Some(2)).unwrap();
        enc.write_key("foo").unwrap();
        enc.begin_dict(Some(1)).unwrap();
        enc.write_key("bar").unwrap();
        enc.begin_array(Some(3)).unwrap();
        enc.write_int(10).unwrap();
        enc.write_int(20).unwrap();
        enc.write_int(30).unwrap();
        enc.end_array().unwrap();
        enc.end_dict().unwrap();
        enc.write_key("baz").unwrap();
        enc.write_string("qux").unwrap();
        enc.end_dict().unwrap();
        enc.extract_output().unwrap()
    }

    #[test]
    fn test_dotted_path_with_negative_index() {
        let buf = sample();
        let root = Value::from_data(&buf).unwrap();
        let v = Path::eval_str("foo.bar[-1]", root, None).unwrap().unwrap();
        assert_eq!(v.as_int(), 30);
        let v = Path::eval_str("$.foo.bar[0]", root, None).unwrap().unwrap();
        assert_eq!(v.as_int(), 10);
        assert!(Path::eval_str("nope.bar", root, None).unwrap().is_none());
    }

    #[test]
    fn test_json_pointer_eval() {
        let buf = sample();
        let root = Value::from_data(&buf).unwrap();
        let v = Path::eval_json_pointer("/foo/bar/2", root, None).unwrap().unwrap();
        assert_eq!(v.as_int(), 30);
        let v = Path::eval_json_pointer("/baz", root, None).unwrap().unwrap();
        assert_eq!(v.as_string(), "qux");
    }

    #[test]
    fn test_json_pointer_must_start_with_slash() {
        let buf = sample();
        let root = Value::from_data(&buf).unwrap();
        assert!(Path::eval_json_pointer("foo/bar", root, None).is_err());
    }

    #[test]
    fn test_escape_unescape_round_trip() {
        let raw = "a/b~c";
        let escaped = escape_token(raw);
        assert_eq!(escaped, "a~1b~0c");
        assert_eq!(unescape_token(&escaped), raw);
    }

    #[test]
    fn test_invalid_array_index_errors() {
        assert!(Path::new("foo[abc]").is_err());
        assert!(Path::new("foo[").is_err());
    }
}
