// Builds a Fleece buffer from a sequence of write events: scalars,
// begin/end array, begin/end dict, key. Children are always written
// before the container that references them (bottom-up), so every
// backpointer is naturally a reference to something already on disk.
//
// Each child value resolves to a `SlotValue`: either the literal 2 bytes
// that belong directly in the parent's slot (`Inline`), or a shared
// handle to the absolute position of an out-of-line cell (`Pointer`).
// The indirection through `Rc<Cell<usize>>` lets [`Encoder::refresh_registry`]
// relocate a value's forwarding cell as the buffer grows, which is how
// we honor the 15-bit backpointer range without a two-pass writer.

use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;

use fleece_base::{err, Error, ErrorKind, Result};

use crate::shared_keys::SharedKeys;
use crate::slice::write_uvarint;
use crate::value::{tag, Value, ValueType};
use crate::writer::Writer;

#[derive(Debug, Clone)]
pub struct EncoderOptions {
    /// Bytes to pre-reserve in the output buffer.
    pub reserve: usize,
    /// Dedup identical strings/blobs already written (§ "String table").
    pub unique_strings: bool,
    /// Sort dict entries by key so lookups can binary-search.
    pub sort_keys: bool,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        EncoderOptions {
            reserve: 256,
            unique_strings: true,
            sort_keys: true,
        }
    }
}

/// The maximum safe word-distance we let a registered position drift to
/// before relaying it; kept well under the 15-bit hard limit (0x7FFF) so
/// a single large intervening write can't jump straight over the limit.
const SAFE_WORD_DISTANCE: usize = 0x4000;

#[derive(Clone)]
enum SlotValue {
    Inline([u8; 2]),
    Pointer(Rc<Cell<usize>>),
}

struct PendingKey {
    key_str: String,
    is_shared: bool,
    shared_code: u32,
    slot: SlotValue,
}

struct DictItem {
    key_str: String,
    is_shared: bool,
    shared_code: u32,
    key_slot: SlotValue,
    val_slot: SlotValue,
}

impl DictItem {
    /// Shared-key integers sort before every string key (§4.5); among
    /// themselves they compare numerically, strings compare lexically.
    fn cmp_order(a: &DictItem, b: &DictItem) -> Ordering {
        match (a.is_shared, b.is_shared) {
            (true, true) => a.shared_code.cmp(&b.shared_code),
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => a.key_str.cmp(&b.key_str),
        }
    }
}

enum Frame {
    Array(Vec<SlotValue>),
    Dict {
        items: Vec<DictItem>,
        pending_key: Option<PendingKey>,
    },
}

pub struct Encoder<'a> {
    writer: Writer,
    /// Length of the logically-preceding base buffer (0 for a plain,
    /// non-delta encoder). All recorded cell positions are in this
    /// "logical" address space — `base_len + writer.length()`, see
    /// [`Encoder::logical_pos`] — so that a
    /// position recorded for a cell already inside `base` (by
    /// `index_base_strings`, which uses `base`'s own 0-based offsets) and a
    /// position recorded for a cell freshly written to `writer` never
    /// collide, and the backpointer arithmetic between them stays exactly
    /// what it would be if `base` and the delta were one contiguous buffer.
    base_len: usize,
    stack: Vec<Frame>,
    string_cache: HashMap<String, Rc<Cell<usize>>>,
    blob_cache: HashMap<Vec<u8>, Rc<Cell<usize>>>,
    registry: Vec<Rc<Cell<usize>>>,
    shared_keys: Option<&'a SharedKeys>,
    options: EncoderOptions,
    sticky: Option<ErrorKind>,
    root: Option<SlotValue>,
}

fn encode_pointer_bytes(word_dist: usize) -> Result<[u8; 2]> {
    if word_dist == 0 || word_dist > 0x7fff {
        return Err(err(ErrorKind::EncodeError, "pointer distance out of 15-bit range"));
    }
    let v = 0x8000u16 | (word_dist as u16);
    Ok(v.to_be_bytes())
}

impl<'a> Encoder<'a> {
    pub fn new(options: EncoderOptions) -> Self {
        Encoder {
            writer: Writer::with_capacity(options.reserve),
            base_len: 0,
            stack: Vec::new(),
            string_cache: HashMap::new(),
            blob_cache: HashMap::new(),
            registry: Vec::new(),
            shared_keys: None,
            options,
            sticky: None,
            root: None,
        }
    }

    /// Starts an encoder whose output is a *delta* against `base`: nothing
    /// from `base` is copied into this encoder's own buffer, but every
    /// position this encoder records is offset by `base.len()`, so a
    /// backpointer from freshly-written content can reach back into `base`
    /// exactly as it would if `base` and the new bytes were one contiguous
    /// buffer. `extract_output()` then returns only the new bytes; the
    /// caller is responsible for physically concatenating them after
    /// `base` before decoding the result (§ "Delta"). When
    /// `reuse_base_strings` is set, strings already present in `base` are
    /// indexed so later `write_string` calls referencing the same content
    /// emit a backpointer into `base` instead of a fresh copy.
    pub fn new_with_base(base: &'a [u8], reuse_base_strings: bool, options: EncoderOptions) -> Result<Self> {
        let mut enc = Encoder::new(options);
        enc.base_len = base.len();
        if reuse_base_strings {
            if let Ok(root) = Value::from_data(base) {
                enc.index_base_strings(&root);
            }
        }
        Ok(enc)
    }

    /// The current write position in the logical address space shared
    /// with `base` (0 when this isn't a delta encoder).
    fn logical_pos(&self) -> usize {
        self.base_len + self.writer.length()
    }

    fn index_base_strings(&mut self, v: &Value) {
        match v.value_type() {
            ValueType::String => {
                let s = v.as_string();
                if s.len() > 1 && !self.string_cache.contains_key(s) {
                    self.string_cache
                        .insert(s.to_string(), Rc::new(Cell::new(v.pos())));
                }
            }
            ValueType::Array => {
                for item in v.as_array().iter() {
                    self.index_base_strings(&item);
                }
            }
            ValueType::Dict => {
                for e in v.as_dict().iter(None) {
                    self.index_base_strings(&e.key);
                    self.index_base_strings(&e.value);
                }
            }
            _ => {}
        }
    }

    pub fn set_shared_keys(&mut self, sk: &'a SharedKeys) {
        self.shared_keys = Some(sk);
    }

    fn check_ok(&self) -> Result<()> {
        if let Some(k) = self.sticky {
            return Err(err(k, "encoder is in a failed state from a prior error"));
        }
        Ok(())
    }

    fn mark_failed(&mut self, e: Error) -> Error {
        tracing::debug!(target: "fleece::encoder", kind = %e.kind(), "encoder latched sticky error");
        self.sticky = Some(e.kind());
        e
    }

    /// Relays any registered position that has drifted too close to the
    /// 15-bit limit: writes a fresh pointer cell at the current tail and
    /// rewinds that position's clock. Called before and after every
    /// out-of-line write so no single write can jump clean over the
    /// limit undetected.
    fn refresh_registry(&mut self) {
        let tail = self.logical_pos();
        for rc in &self.registry {
            let p = rc.get();
            if p + SAFE_WORD_DISTANCE * 2 < tail {
                let new_pos = self.logical_pos();
                let word_dist = (new_pos + 2 - p) / 2;
                if word_dist == 0 || word_dist > 0x7fff {
                    // Already stale beyond recovery; leave it for
                    // `slot_bytes`/`extract_output` to report as an error.
                    continue;
                }
                let bytes = 0x8000u16 | (word_dist as u16);
                self.writer.write(&bytes.to_be_bytes());
                self.writer.pad_to_even();
                rc.set(new_pos);
            }
        }
    }

    fn slot_bytes(&self, slot: &SlotValue, slot_pos: usize) -> Result<[u8; 2]> {
        match slot {
            SlotValue::Inline(b) => Ok(*b),
            SlotValue::Pointer(rc) => {
                let p = rc.get();
                if p >= slot_pos {
                    return Err(err(ErrorKind::InternalError, "pointer target is not behind its slot"));
                }
                let word_dist = (slot_pos + 2 - p) / 2;
                encode_pointer_bytes(word_dist)
            }
        }
    }

    fn emit_count_header(&mut self, kind: u8, count: usize) -> Result<usize> {
        let pos = self.logical_pos();
        if count as u32 <= tag::MAX_INLINE_COUNT as u32 {
            let v = ((kind as u16) << 12) | (count as u16);
            self.writer.write(&v.to_be_bytes());
        } else {
            let v = ((kind as u16) << 12) | tag::WIDE_COUNT_SENTINEL;
            self.writer.write(&v.to_be_bytes());
            let mut buf = Vec::new();
            write_uvarint(count as u64, &mut buf);
            self.writer.write(&buf);
        }
        Ok(pos)
    }

    fn push_finished_slot(&mut self, slot: SlotValue) -> Result<()> {
        match self.stack.last_mut() {
            None => {
                if self.root.is_some() {
                    let e = err(ErrorKind::EncodeError, "encoder already has a top-level value");
                    return Err(self.mark_failed(e));
                }
                self.root = Some(slot);
                Ok(())
            }
            Some(Frame::Array(items)) => {
                items.push(slot);
                Ok(())
            }
            Some(Frame::Dict { items, pending_key }) => {
                let Some(key) = pending_key.take() else {
                    let e = err(ErrorKind::EncodeError, "dict value written without a preceding key");
                    return Err(self.mark_failed(e));
                };
                items.push(DictItem {
                    key_str: key.key_str,
                    is_shared: key.is_shared,
                    shared_code: key.shared_code,
                    key_slot: key.slot,
                    val_slot: slot,
                });
                Ok(())
            }
        }
    }

    fn standalone_int_bytes(&mut self, bytes: &[u8], signed: bool) -> SlotValue {
        self.refresh_registry();
        let pos = self.logical_pos();
        let low = ((bytes.len() - 1) as u8) | if signed { 0x08 } else { 0 };
        self.writer.write_byte((tag::INT << 4) | low);
        self.writer.write(bytes);
        self.writer.pad_to_even();
        self.refresh_registry();
        let rc = Rc::new(Cell::new(pos));
        self.registry.push(rc.clone());
        SlotValue::Pointer(rc)
    }

    fn int_slot(&mut self, v: i64) -> SlotValue {
        if (-8..=7).contains(&v) {
            let nibble = (v as i8 as u8) & 0x0f;
            return SlotValue::Inline([(tag::SMALL_INT << 4) | nibble, 0]);
        }
        let bytes = v.to_be_bytes();
        let mut n = 8;
        for len in 1..8 {
            let start = 8 - len;
            let fill: u8 = if bytes[start] & 0x80 != 0 { 0xff } else { 0x00 };
            let mut candidate = [fill; 8];
            candidate[8 - len..].copy_from_slice(&bytes[8 - len..]);
            if i64::from_be_bytes(candidate) == v {
                n = len;
                break;
            }
        }
        self.standalone_int_bytes(&bytes[8 - n..], true)
    }

    fn unsigned_slot(&mut self, v: u64) -> SlotValue {
        if (0..=7).contains(&v) {
            return SlotValue::Inline([(tag::SMALL_INT << 4) | (v as u8), 0]);
        }
        let bytes = v.to_be_bytes();
        let mut n = 8;
        for len in 1..8 {
            let mut candidate = [0u8; 8];
            candidate[8 - len..].copy_from_slice(&bytes[8 - len..]);
            if u64::from_be_bytes(candidate) == v {
                n = len;
                break;
            }
        }
        self.standalone_int_bytes(&bytes[8 - n..], false)
    }

    pub fn write_null(&mut self) -> Result<()> {
        self.check_ok()?;
        self.push_finished_slot(SlotValue::Inline([(tag::SPECIAL << 4) | tag::SPECIAL_NULL, 0]))
    }

    pub fn write_bool(&mut self, b: bool) -> Result<()> {
        self.check_ok()?;
        let low = if b { tag::SPECIAL_TRUE } else { tag::SPECIAL_FALSE };
        self.push_finished_slot(SlotValue::Inline([(tag::SPECIAL << 4) | low, 0]))
    }

    pub fn write_int(&mut self, v: i64) -> Result<()> {
        self.check_ok()?;
        let slot = self.int_slot(v);
        self.push_finished_slot(slot)
    }

    pub fn write_unsigned(&mut self, v: u64) -> Result<()> {
        self.check_ok()?;
        let slot = self.unsigned_slot(v);
        self.push_finished_slot(slot)
    }

    pub fn write_double(&mut self, v: f64) -> Result<()> {
        self.check_ok()?;
        self.refresh_registry();
        let pos = self.logical_pos();
        self.writer.write_byte((tag::FLOAT << 4) | 1);
        self.writer.write(&v.to_be_bytes());
        self.writer.pad_to_even();
        self.refresh_registry();
        let rc = Rc::new(Cell::new(pos));
        self.registry.push(rc.clone());
        self.push_finished_slot(SlotValue::Pointer(rc))
    }

    pub fn write_float(&mut self, v: f32) -> Result<()> {
        self.check_ok()?;
        self.refresh_registry();
        let pos = self.logical_pos();
        self.writer.write_byte(tag::FLOAT << 4);
        self.writer.write(&v.to_be_bytes());
        self.writer.pad_to_even();
        self.refresh_registry();
        let rc = Rc::new(Cell::new(pos));
        self.registry.push(rc.clone());
        self.push_finished_slot(SlotValue::Pointer(rc))
    }

    fn string_slot(&mut self, s: &str) -> SlotValue {
        if s.len() <= 1 {
            let mut b = [(tag::STRING << 4) | (s.len() as u8), 0];
            if s.len() == 1 {
                b[1] = s.as_bytes()[0];
            }
            return SlotValue::Inline(b);
        }
        if self.options.unique_strings {
            if let Some(rc) = self.string_cache.get(s) {
                return SlotValue::Pointer(rc.clone());
            }
        }
        self.refresh_registry();
        let pos = self.logical_pos();
        if s.len() <= 15 {
            self.writer.write_byte((tag::STRING << 4) | (s.len() as u8));
            self.writer.write(s.as_bytes());
        } else {
            self.writer.write_byte(tag::DATA << 4);
            let mut buf = Vec::new();
            write_uvarint(s.len() as u64, &mut buf);
            self.writer.write(&buf);
            self.writer.write(s.as_bytes());
        }
        self.writer.pad_to_even();
        self.refresh_registry();
        let rc = Rc::new(Cell::new(pos));
        self.registry.push(rc.clone());
        if self.options.unique_strings {
            self.string_cache.insert(s.to_string(), rc.clone());
        }
        SlotValue::Pointer(rc)
    }

    pub fn write_string(&mut self, s: &str) -> Result<()> {
        self.check_ok()?;
        let slot = self.string_slot(s);
        self.push_finished_slot(slot)
    }

    fn data_slot(&mut self, data: &[u8]) -> SlotValue {
        if self.options.unique_strings {
            if let Some(rc) = self.blob_cache.get(data) {
                return SlotValue::Pointer(rc.clone());
            }
        }
        self.refresh_registry();
        let pos = self.logical_pos();
        self.writer.write_byte((tag::DATA << 4) | tag::IS_BLOB_BIT);
        let mut buf = Vec::new();
        write_uvarint(data.len() as u64, &mut buf);
        self.writer.write(&buf);
        self.writer.write(data);
        self.writer.pad_to_even();
        self.refresh_registry();
        let rc = Rc::new(Cell::new(pos));
        self.registry.push(rc.clone());
        if self.options.unique_strings {
            self.blob_cache.insert(data.to_vec(), rc.clone());
        }
        SlotValue::Pointer(rc)
    }

    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.check_ok()?;
        let slot = self.data_slot(data);
        self.push_finished_slot(slot)
    }

    /// Writes `bytes` verbatim as a standalone out-of-line cell and pushes
    /// a pointer to it into the current slot. `bytes` must already be a
    /// complete, tagged Fleece cell; the caller is responsible for its
    /// validity (this is an escape hatch for callers building cells the
    /// typed `write_*` methods don't cover, not a general-purpose API).
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_ok()?;
        if bytes.is_empty() {
            let e = err(ErrorKind::EncodeError, "write_raw with empty bytes");
            return Err(self.mark_failed(e));
        }
        self.refresh_registry();
        let pos = self.logical_pos();
        self.writer.write(bytes);
        self.writer.pad_to_even();
        self.refresh_registry();
        let rc = Rc::new(Cell::new(pos));
        self.registry.push(rc.clone());
        self.push_finished_slot(SlotValue::Pointer(rc))
    }

    /// Copies an already-decoded `Value` into this encoder as a fresh
    /// write-event sequence, recursing into arrays and dicts. If the
    /// source document used shared keys, pass its table as `source_sk` so
    /// dict keys are resolved back to strings and re-admitted against
    /// this encoder's own table (which may assign different codes, or
    /// none at all).
    pub fn write_value(&mut self, v: &Value, source_sk: Option<&SharedKeys>) -> Result<()> {
        self.check_ok()?;
        match v.value_type() {
            ValueType::Null | ValueType::Undefined => self.write_null(),
            ValueType::Bool => self.write_bool(v.as_bool()),
            ValueType::Int => self.write_int(v.as_int()),
            ValueType::Double => {
                if v.is_float32() {
                    self.write_float(v.as_float())
                } else {
                    self.write_double(v.as_double())
                }
            }
            ValueType::String => self.write_string(v.as_string()),
            ValueType::Blob => self.write_data(v.as_data()),
            ValueType::Array => {
                let a = v.as_array();
                self.begin_array(Some(a.count() as usize))?;
                for item in a.iter() {
                    self.write_value(&item, source_sk)?;
                }
                self.end_array()
            }
            ValueType::Dict => {
                let d = v.as_dict();
                self.begin_dict(Some(d.count() as usize))?;
                for e in d.iter(source_sk) {
                    let key = e.key_string(source_sk).ok_or_else(|| {
                        err(ErrorKind::EncodeError, "dict key cannot be resolved to a string")
                    })?;
                    self.write_key(&key)?;
                    self.write_value(&e.value, source_sk)?;
                }
                self.end_dict()
            }
        }
    }

    pub fn begin_array(&mut self, count_hint: Option<usize>) -> Result<()> {
        self.check_ok()?;
        tracing::trace!(target: "fleece::encoder", depth = self.stack.len(), "begin_array");
        self.stack.push(Frame::Array(Vec::with_capacity(count_hint.unwrap_or(0))));
        Ok(())
    }

    pub fn end_array(&mut self) -> Result<()> {
        self.check_ok()?;
        let Some(Frame::Array(items)) = self.stack.pop() else {
            let e = err(ErrorKind::EncodeError, "end_array without a matching begin_array");
            return Err(self.mark_failed(e));
        };
        tracing::trace!(target: "fleece::encoder", count = items.len(), "end_array");
        self.refresh_registry();
        let count = items.len();
        let pos = self.emit_count_header(tag::ARRAY, count)?;
        for item in &items {
            let slot_pos = self.logical_pos();
            let b = self.slot_bytes(item, slot_pos).map_err(|e| self.mark_failed(e))?;
            self.writer.write(&b);
        }
        self.writer.pad_to_even();
        let rc = Rc::new(Cell::new(pos));
        self.registry.push(rc.clone());
        self.push_finished_slot(SlotValue::Pointer(rc))
    }

    pub fn begin_dict(&mut self, count_hint: Option<usize>) -> Result<()> {
        self.check_ok()?;
        tracing::trace!(target: "fleece::encoder", depth = self.stack.len(), "begin_dict");
        self.stack.push(Frame::Dict {
            items: Vec::with_capacity(count_hint.unwrap_or(0)),
            pending_key: None,
        });
        Ok(())
    }

    pub fn write_key(&mut self, key: &str) -> Result<()> {
        self.check_ok()?;
        let Some(Frame::Dict { pending_key, .. }) = self.stack.last_mut() else {
            let e = err(ErrorKind::EncodeError, "write_key outside of a dict");
            return Err(self.mark_failed(e));
        };
        if pending_key.is_some() {
            let e = err(ErrorKind::EncodeError, "write_key called twice without an intervening value");
            return Err(self.mark_failed(e));
        }
        let (slot, is_shared, shared_code) = if let Some(sk) = self.shared_keys {
            match sk.encode(key) {
                Some(code) => (self.int_slot(code as i64), true, code),
                None => (self.string_slot(key), false, 0),
            }
        } else {
            (self.string_slot(key), false, 0)
        };
        let Some(Frame::Dict { pending_key, .. }) = self.stack.last_mut() else {
            unreachable!("checked above");
        };
        *pending_key = Some(PendingKey {
            key_str: key.to_string(),
            is_shared,
            shared_code,
            slot,
        });
        Ok(())
    }

    pub fn end_dict(&mut self) -> Result<()> {
        self.check_ok()?;
        let Some(Frame::Dict { mut items, pending_key }) = self.stack.pop() else {
            let e = err(ErrorKind::EncodeError, "end_dict without a matching begin_dict");
            return Err(self.mark_failed(e));
        };
        if pending_key.is_some() {
            let e = err(ErrorKind::EncodeError, "dict closed with a key but no value");
            return Err(self.mark_failed(e));
        }
        tracing::trace!(target: "fleece::encoder", count = items.len(), sort_keys = self.options.sort_keys, "end_dict");
        if self.options.sort_keys {
            items.sort_by(DictItem::cmp_order);
        }
        self.refresh_registry();
        let count = items.len();
        let pos = self.emit_count_header(tag::DICT, count)?;
        for item in &items {
            let slot_pos = self.logical_pos();
            let kb = self.slot_bytes(&item.key_slot, slot_pos).map_err(|e| self.mark_failed(e))?;
            self.writer.write(&kb);
            let slot_pos2 = self.logical_pos();
            let vb = self.slot_bytes(&item.val_slot, slot_pos2).map_err(|e| self.mark_failed(e))?;
            self.writer.write(&vb);
        }
        self.writer.pad_to_even();
        let rc = Rc::new(Cell::new(pos));
        self.registry.push(rc.clone());
        self.push_finished_slot(SlotValue::Pointer(rc))
    }

    /// Finishes encoding and returns the buffer, trailed by a root
    /// pointer cell as its final 2 bytes (§ "Root").
    pub fn extract_output(mut self) -> Result<Vec<u8>> {
        self.check_ok()?;
        if !self.stack.is_empty() {
            let e = err(ErrorKind::EncodeError, "unclosed array or dict at end of encoding");
            return Err(self.mark_failed(e));
        }
        let Some(root) = self.root.take() else {
            return Err(err(ErrorKind::EncodeError, "no value was written"));
        };
        self.refresh_registry();
        let root_pos = match root {
            SlotValue::Pointer(rc) => rc.get(),
            SlotValue::Inline(bytes) => {
                // The trailing root pointer is mandatory, so even an
                // inline-sized scalar gets promoted to a standalone cell.
                let pos = self.logical_pos();
                self.writer.write(&bytes);
                pos
            }
        };
        let tail = self.logical_pos();
        let word_dist = (tail + 2 - root_pos) / 2;
        let ptr = encode_pointer_bytes(word_dist).map_err(|e| self.mark_failed(e))?;
        self.writer.write(&ptr);
        Ok(self.writer.extract_output())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::value::Value;
    use test_log::test;

    #[test]
    fn test_scalar_roundtrip() {
        let mut enc = Encoder::new(EncoderOptions::default());
        enc.write_int(-12345).unwrap();
        let buf = enc.extract_output().unwrap();
        let v = Value::from_data(&buf).unwrap();
        assert_eq!(v.as_int(), -12345);
    }

    #[test]
    fn test_small_int_range_including_negatives() {
        // -8..=7 all fit in the inline 4-bit small-int nibble; every other
        // value in this test is routed through the standalone int cell.
        for v in -10i64..=10 {
            let mut enc = Encoder::new(EncoderOptions::default());
            enc.write_int(v).unwrap();
            let buf = enc.extract_output().unwrap();
            let decoded = Value::from_data(&buf).unwrap();
            assert_eq!(decoded.as_int(), v, "round-trip failed for {v}");
        }
    }

    #[test]
    fn test_nested_array_of_dicts() {
        let mut enc = Encoder::new(EncoderOptions {
            sort_keys: true,
            ..Default::default()
        });
        enc.begin_array(Some(2)).unwrap();
        for i in 0..2 {
            enc.begin_dict(Some(2)).unwrap();
            enc.write_key("id").unwrap();
            enc.write_int(i).unwrap();
            enc.write_key("name").unwrap();
            enc.write_string("widget").unwrap();
            enc.end_dict().unwrap();
        }
        enc.end_array().unwrap();
        let buf = enc.extract_output().unwrap();
        let root = Value::from_data(&buf).unwrap();
        let a = root.as_array();
        assert_eq!(a.count(), 2);
        let d0 = a.get(0).unwrap().as_dict();
        assert_eq!(d0.get("id").unwrap().as_int(), 0);
        assert_eq!(d0.get("name").unwrap().as_string(), "widget");
    }

    #[test]
    fn test_string_dedup() {
        let mut enc = Encoder::new(EncoderOptions::default());
        enc.begin_array(Some(2)).unwrap();
        enc.write_string("repeated value").unwrap();
        enc.write_string("repeated value").unwrap();
        enc.end_array().unwrap();
        let buf = enc.extract_output().unwrap();
        let root = Value::from_data(&buf).unwrap();
        let a = root.as_array();
        let (v0, v1) = (a.get(0).unwrap(), a.get(1).unwrap());
        assert_eq!(v0.as_string(), "repeated value");
        // Deduped strings decode to the same underlying cell.
        assert_eq!(v0.pos(), v1.pos());
    }

    #[test]
    fn test_idempotent_reencode() {
        let mut enc = Encoder::new(EncoderOptions {
            sort_keys: true,
            ..Default::default()
        });
        enc.begin_dict(Some(2)).unwrap();
        enc.write_key("a").unwrap();
        enc.write_int(1).unwrap();
        enc.write_key("b").unwrap();
        enc.write_bool(true).unwrap();
        enc.end_dict().unwrap();
        let buf1 = enc.extract_output().unwrap();
        let root1 = Value::from_data(&buf1).unwrap();

        let mut enc2 = Encoder::new(EncoderOptions {
            sort_keys: true,
            ..Default::default()
        });
        let d = root1.as_dict();
        enc2.begin_dict(Some(d.count() as usize)).unwrap();
        for e in d.iter(None) {
            enc2.write_key(&e.key_string(None).unwrap()).unwrap();
            match e.value.value_type() {
                crate::value::ValueType::Int => enc2.write_int(e.value.as_int()).unwrap(),
                crate::value::ValueType::Bool => enc2.write_bool(e.value.as_bool()).unwrap(),
                _ => unreachable!(),
            }
        }
        enc2.end_dict().unwrap();
        let buf2 = enc2.extract_output().unwrap();
        assert_eq!(buf1, buf2);
    }

    #[test]
    fn test_write_value_copies_existing_document() {
        let mut src = Encoder::new(EncoderOptions {
            sort_keys: true,
            ..Default::default()
        });
        src.begin_dict(Some(2)).unwrap();
        src.write_key("a").unwrap();
        src.write_int(1).unwrap();
        src.write_key("b").unwrap();
        src.begin_array(Some(2)).unwrap();
        src.write_string("x").unwrap();
        src.write_bool(true).unwrap();
        src.end_array().unwrap();
        src.end_dict().unwrap();
        let src_buf = src.extract_output().unwrap();
        let src_root = Value::from_data(&src_buf).unwrap();

        let mut dst = Encoder::new(EncoderOptions {
            sort_keys: true,
            ..Default::default()
        });
        dst.write_value(&src_root, None).unwrap();
        let dst_buf = dst.extract_output().unwrap();
        let dst_root = Value::from_data(&dst_buf).unwrap();
        assert!(src_root.is_equal(&dst_root));
    }

    #[test]
    fn test_write_value_rewrites_shared_keys_across_tables() {
        let src_sk = SharedKeys::new();
        let mut src = Encoder::new(EncoderOptions {
            sort_keys: true,
            ..Default::default()
        });
        src.set_shared_keys(&src_sk);
        src.begin_dict(Some(1)).unwrap();
        src.write_key("name").unwrap();
        src.write_string("Jo").unwrap();
        src.end_dict().unwrap();
        let src_buf = src.extract_output().unwrap();
        let src_root = Value::from_data(&src_buf).unwrap();

        // Destination has no shared-keys table at all; the copy should
        // still resolve "name" back to a literal string key.
        let mut dst = Encoder::new(EncoderOptions {
            sort_keys: true,
            ..Default::default()
        });
        dst.write_value(&src_root, Some(&src_sk)).unwrap();
        let dst_buf = dst.extract_output().unwrap();
        let dst_root = Value::from_data(&dst_buf).unwrap();
        assert_eq!(dst_root.as_dict().get("name").unwrap().as_string(), "Jo");
    }

    #[test]
    fn test_write_raw_standalone_cell() {
        let mut enc = Encoder::new(EncoderOptions::default());
        enc.begin_array(Some(1)).unwrap();
        // A standalone small-int cell for the value 5, pre-tagged by hand.
        enc.write_raw(&[(tag::SMALL_INT << 4) | 5, 0]).unwrap();
        enc.end_array().unwrap();
        let buf = enc.extract_output().unwrap();
        let root = Value::from_data(&buf).unwrap();
        assert_eq!(root.as_array().get(0).unwrap().as_int(), 5);
    }

    #[test]
    fn test_sticky_error_after_malformed_grammar() {
        let mut enc = Encoder::new(EncoderOptions::default());
        enc.begin_dict(None).unwrap();
        assert!(enc.end_array().is_err());
        assert!(enc.write_int(1).is_err());
    }

    #[test]
    fn test_shared_key_dict() {
        let sk = SharedKeys::new();
        let mut enc = Encoder::new(EncoderOptions {
            sort_keys: true,
            ..Default::default()
        });
        enc.set_shared_keys(&sk);
        enc.begin_dict(Some(1)).unwrap();
        enc.write_key("name").unwrap();
        enc.write_string("Jo").unwrap();
        enc.end_dict().unwrap();
        let buf = enc.extract_output().unwrap();
        let root = Value::from_data(&buf).unwrap();
        assert_eq!(
            root.as_dict().get_with_shared_keys("name", &sk).unwrap().as_string(),
            "Jo"
        );
    }

    #[test]
    fn test_delta_encoding_concatenates_onto_base() {
        let mut base_enc = Encoder::new(EncoderOptions {
            sort_keys: true,
            ..Default::default()
        });
        base_enc.begin_dict(Some(2)).unwrap();
        base_enc.write_key("greeting").unwrap();
        base_enc.write_string("hello from the base document, long enough to go out of line").unwrap();
        base_enc.write_key("count").unwrap();
        base_enc.write_int(1).unwrap();
        base_enc.end_dict().unwrap();
        let base = base_enc.extract_output().unwrap();
        assert!(Value::from_data(&base).is_ok());

        // The delta reuses the base's long string by content instead of
        // copying it again, and adds a new top-level array of its own.
        let mut delta_enc = Encoder::new_with_base(&base, true, EncoderOptions::default()).unwrap();
        delta_enc.begin_array(Some(2)).unwrap();
        delta_enc.write_string("hello from the base document, long enough to go out of line").unwrap();
        delta_enc.write_int(42).unwrap();
        delta_enc.end_array().unwrap();
        let delta = delta_enc.extract_output().unwrap();

        // The delta alone is not decodable: its backpointers reach behind
        // its own start, into where `base` belongs.
        assert!(Value::from_data(&delta).is_err());

        // Concatenating base and delta reconstructs the address space the
        // delta's backpointers were written against.
        let mut combined = base.clone();
        combined.extend_from_slice(&delta);
        let root = Value::from_data(&combined).unwrap();
        let a = root.as_array();
        assert_eq!(a.count(), 2);
        assert_eq!(
            a.get(0).unwrap().as_string(),
            "hello from the base document, long enough to go out of line"
        );
        assert_eq!(a.get(1).unwrap().as_int(), 42);
    }
}
