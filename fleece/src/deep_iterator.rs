// A depth-first, skippable traversal that yields every descendant of a
// root value (never the root itself) along with its full path. Grounded
// closely on the original `DeepIterator::next()` state machine: a
// front-pushed stack of "resume here" frames, each either a genuine
// deferred container or a bare end-of-level marker, plus whichever array
// or dict iterator is currently active. The original uses a `deque` and
// pushes/pops only at the front; since it never touches the back, a plain
// `Vec` used as a stack is equivalent here.

use crate::shared_keys::SharedKeys;
use crate::value::{ArrayIter, DictIter, Value, ValueType};

/// One step of a path from the root to the current node: either a
/// dictionary key (`key = Some(..)`) or an array index (`key = None`,
/// `index` is the position).
#[derive(Debug, Clone)]
pub struct PathComponent {
    pub key: Option<String>,
    pub index: u32,
}

pub struct DeepIterator<'a> {
    sk: Option<&'a SharedKeys>,
    value: Option<Value<'a>>,
    path: Vec<PathComponent>,
    skip_children: bool,
    array_it: Option<ArrayIter<'a>>,
    array_index: u32,
    dict_it: Option<DictIter<'a>>,
    // Deferred containers waiting to be descended into once the current
    // level is exhausted. `None` in the second slot is an end-of-level
    // marker pushed by `iterate_container` for every level entered.
    stack: Vec<(PathComponent, Option<Value<'a>>)>,
}

impl<'a> DeepIterator<'a> {
    pub fn new(root: Value<'a>, sk: Option<&'a SharedKeys>) -> Self {
        DeepIterator {
            sk,
            value: Some(root),
            path: Vec::new(),
            skip_children: false,
            array_it: None,
            array_index: 0,
            dict_it: None,
            stack: Vec::new(),
        }
    }

    /// The current node, or `None` once iteration has finished. `None`
    /// before the first call to `next()` too: the root is never yielded.
    pub fn value(&self) -> Option<Value<'a>> {
        self.value
    }

    /// The dict key at the innermost path step, if the current node was
    /// reached through one; `None` for an array step or before the first
    /// `next()`.
    pub fn key_string(&self) -> Option<&str> {
        self.path.last().and_then(|c| c.key.as_deref())
    }

    /// The array index at the innermost path step; 0 for a dict step or
    /// before the first `next()`.
    pub fn index(&self) -> u32 {
        self.path.last().map(|c| c.index).unwrap_or(0)
    }

    /// The full path from the root to the current node.
    pub fn path(&self) -> &[PathComponent] {
        &self.path
    }

    /// Renders `path()` as an RFC 6901 JSON Pointer. The root position
    /// (before any `next()`, or once iteration has ended) is `"/"`.
    pub fn json_pointer(&self) -> String {
        if self.path.is_empty() {
            return "/".to_string();
        }
        let mut s = String::new();
        for c in &self.path {
            s.push('/');
            match &c.key {
                Some(k) => s.push_str(&crate::path::escape_token(k)),
                None => s.push_str(&c.index.to_string()),
            }
        }
        s
    }

    /// When the *next* call to `next()` would otherwise descend into the
    /// current node's children, skip them instead.
    pub fn skip_children(&mut self) {
        self.skip_children = true;
    }

    fn iterate_container(&mut self, container: Value<'a>) {
        self.stack.push((PathComponent { key: None, index: 0 }, None));
        match container.value_type() {
            ValueType::Array => {
                self.array_it = Some(container.as_array().iter());
                self.array_index = 0;
            }
            ValueType::Dict => {
                self.dict_it = Some(container.as_dict().iter(self.sk));
            }
            _ => {}
        }
    }

    /// Defers descent into the current node (if it's a container) by
    /// pushing it, paired with its own path component, onto the stack.
    fn queue_children(&mut self) {
        let v = self.value.expect("queue_children called with no current value");
        if matches!(v.value_type(), ValueType::Array | ValueType::Dict) {
            let comp = self
                .path
                .last()
                .cloned()
                .unwrap_or(PathComponent { key: None, index: 0 });
            self.stack.push((comp, Some(v)));
        }
    }

    /// Advances to the next descendant in depth-first order.
    pub fn next(&mut self) {
        if self.value.is_none() {
            return;
        }
        if self.skip_children {
            self.skip_children = false;
        } else if self.path.is_empty() {
            let v = self.value.unwrap();
            self.iterate_container(v);
        } else {
            self.queue_children();
        }
        if !self.path.is_empty() {
            self.path.pop();
        }

        loop {
            if self.array_it.is_some() {
                match self.array_it.as_mut().unwrap().next() {
                    Some(v) => {
                        self.value = Some(v);
                        self.path.push(PathComponent {
                            key: None,
                            index: self.array_index,
                        });
                        self.array_index += 1;
                    }
                    None => {
                        self.array_it = None;
                        self.value = None;
                    }
                }
            } else if self.dict_it.is_some() {
                match self.dict_it.as_mut().unwrap().next() {
                    Some(e) => {
                        let key = e.key_string(self.sk);
                        self.value = Some(e.value);
                        self.path.push(PathComponent { key, index: 0 });
                    }
                    None => {
                        self.dict_it = None;
                        self.value = None;
                    }
                }
            } else {
                self.value = None;
                loop {
                    match self.stack.last() {
                        Some((_, None)) => {
                            if self.path.is_empty() {
                                return;
                            }
                            self.path.pop();
                            self.stack.pop();
                        }
                        Some((_, Some(_))) => break,
                        None => return,
                    }
                }
                let (comp, container) = self.stack.pop().expect("checked non-empty above");
                self.path.push(comp);
                if let Some(c) = container {
                    self.iterate_container(c);
                }
            }
            if self.value.is_some() {
                break;
            }
        }
    }
}

impl<'a> Iterator for DeepIterator<'a> {
    type Item = Value<'a>;
    fn next(&mut self) -> Option<Value<'a>> {
        DeepIterator::next(self);
        self.value()
    }
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
        enc.begin_dict(Some(1)).unwrap();
        enc.write_key("x").unwrap();
        enc.begin_array(Some(1)).unwrap();
        enc.begin_dict(Some(1)).unwrap();
        enc.write_key("y").unwrap();
        enc.write_int(42).unwrap();
        enc.end_dict().unwrap();
        enc.end_array().unwrap();
        enc.end_dict().unwrap();
        enc.extract_output().unwrap()
    }

    #[test]
    fn test_root_is_never_yielded() {
        let buf = sample();
        let root = Value::from_data(&buf).unwrap();
        let it = DeepIterator::new(root, None);
        assert!(it.value().is_none());
    }

    #[test]
    fn test_depth_first_sequence_with_json_pointers() {
        let buf = sample();
        let root = Value::from_data(&buf).unwrap();
        let mut it = DeepIterator::new(root, None);

        let mut seen = Vec::new();
        loop {
            it.next();
            let Some(v) = it.value() else { break };
            seen.push((it.json_pointer(), v.value_type()));
        }
        assert_eq!(
            seen,
            vec![
                ("/x".to_string(), ValueType::Array),
                ("/x/0".to_string(), ValueType::Dict),
                ("/x/0/y".to_string(), ValueType::Int),
            ]
        );
    }

    #[test]
    fn test_skip_children_prunes_subtree() {
        let buf = sample();
        let root = Value::from_data(&buf).unwrap();
        let mut it = DeepIterator::new(root, None);

        it.next();
        assert_eq!(it.value().unwrap().value_type(), ValueType::Array);
        it.skip_children();
        it.next();
        // With the array's only element skipped, iteration ends.
        assert!(it.value().is_none());
    }

    #[test]
    fn test_scalar_root_yields_nothing() {
        let mut enc = Encoder::new(EncoderOptions::default());
        enc.write_int(7).unwrap();
        let buf = enc.extract_output().unwrap();
        let root = Value::from_data(&buf).unwrap();
        let mut it = DeepIterator::new(root, None);
        it.next();
        assert!(it.value().is_none());
    }

    #[test]
    fn test_path_and_json_pointer_roundtrip_via_eval() {
        let buf = sample();
        let root = Value::from_data(&buf).unwrap();
        let mut it = DeepIterator::new(root, None);
        while it.next_and_check() {
            let ptr = it.json_pointer();
            let found = crate::path::Path::eval_json_pointer(&ptr, root, None)
                .unwrap()
                .unwrap();
            assert!(found.is_equal(&it.value().unwrap()));
        }
    }

    impl<'a> DeepIterator<'a> {
        /// Test helper: advances and reports whether a value remains.
        fn next_and_check(&mut self) -> bool {
            self.next();
            self.value().is_some()
        }
    }
}
