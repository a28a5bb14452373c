// The tagged on-disk layout (spec §3) and the read-side primitives: typed
// accessors, bounds-safe navigation, array indexing, dictionary lookup by
// string or by integer shared-key.
//
// A `Value` is a pure view: it owns nothing and borrows the backing buffer,
// the same way the teacher's `ioutil::Reader` implementations only ever
// hand out byte ranges rather than copies. There is no parent pointer or
// refcount; the buffer itself is the arena, and cyclic references are
// structurally impossible because every pointer points strictly backwards.

use std::cell::Cell;
use std::cmp::Ordering;

use fleece_base::{err, ErrorKind, Result};

use crate::shared_keys::SharedKeys;
use crate::slice::Slice;

pub(crate) mod tag {
    pub const SMALL_INT: u8 = 0x0;
    pub const INT: u8 = 0x1;
    pub const FLOAT: u8 = 0x2;
    pub const SPECIAL: u8 = 0x3;
    pub const STRING: u8 = 0x4;
    pub const DATA: u8 = 0x5;
    pub const ARRAY: u8 = 0x6;
    pub const DICT: u8 = 0x7;

    pub const SPECIAL_NULL: u8 = 0;
    pub const SPECIAL_FALSE: u8 = 1;
    pub const SPECIAL_TRUE: u8 = 2;

    pub const IS_BLOB_BIT: u8 = 0x08;

    /// Header value (12 low bits of the 2-byte array/dict header) that
    /// means "the real count doesn't fit here; read a varint next".
    pub const WIDE_COUNT_SENTINEL: u16 = 0x7FF;
    pub const MAX_INLINE_COUNT: u16 = 0x7FE;
}

/// The set of logical kinds a decoded `Value` can report via `value_type()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Null,
    Bool,
    Int,
    Double,
    String,
    Blob,
    Array,
    Dict,
    /// No value is present at all (distinct from JSON null). Never produced
    /// by a well-formed document; reserved for API parity with the source
    /// model's nullable-pointer `Value*`.
    Undefined,
}

/// A borrowed view of a single encoded cell within a Fleece buffer.
#[derive(Clone, Copy)]
pub struct Value<'a> {
    doc: &'a [u8],
    pos: usize,
}

impl<'a> std::fmt::Debug for Value<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Value({:?} @ {})", self.value_type(), self.pos)
    }
}

fn be_bytes_to_u64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

/// Sign-extends the low `bits` bits of `val` to a full `i64`.
fn sign_extend_bits(val: u64, bits: u32) -> i64 {
    if bits >= 64 {
        return val as i64;
    }
    let sign_bit = 1u64 << (bits - 1);
    if val & sign_bit != 0 {
        (val as i64).wrapping_sub(1i64 << bits)
    } else {
        val as i64
    }
}

/// Sign-extends a `byte_len`-byte big-endian integer (as read off the wire)
/// to a full `i64`.
fn sign_extend(val: u64, byte_len: usize) -> i64 {
    sign_extend_bits(val, (byte_len * 8) as u32)
}

/// Reads a 2-byte (or 2-byte + varint) count header at `pos`, returning
/// `(header_byte_len, count)`.
fn read_count_header(doc: &[u8], pos: usize) -> Option<(usize, u32)> {
    let b0 = *doc.get(pos)?;
    let b1 = *doc.get(pos + 1)?;
    let raw = (((b0 & 0x0f) as u16) << 8) | b1 as u16;
    if raw == tag::WIDE_COUNT_SENTINEL {
        let rest = doc.get(pos + 2..)?;
        let mut s = Slice::new(rest);
        let before = s.len();
        let count = s.read_uvarint()?;
        let varint_len = before - s.len();
        Some((2 + varint_len, count as u32))
    } else {
        Some((2, raw as u32))
    }
}

impl<'a> Value<'a> {
    /// Validates `buf` as a complete, well-formed Fleece document (every
    /// pointer target in range, every tag recognized, every cell aligned)
    /// and returns a view of its root value.
    pub fn from_data(buf: &'a [u8]) -> Result<Value<'a>> {
        if buf.len() < 2 || buf.len() % 2 != 0 {
            return Err(err(ErrorKind::InvalidData, "buffer too short or misaligned"));
        }
        let root_pos = buf.len() - 2;
        validate_cell(buf, root_pos, root_pos)?;
        Value::at(buf, root_pos).ok_or_else(|| err(ErrorKind::InvalidData, "bad root pointer"))
    }

    /// Wraps `buf` without validation. The caller warrants it is
    /// well-formed; malformed input may yield garbage values or `None`
    /// from accessors, but (being safe Rust) never undefined behavior.
    pub fn from_trusted_data(buf: &'a [u8]) -> Value<'a> {
        let root_pos = buf.len().saturating_sub(2);
        Value::at(buf, root_pos).unwrap_or(Value { doc: &[], pos: 0 })
    }

    /// Resolves the cell at `pos`, following any chain of backpointers
    /// (the encoder's "trampoline" spill can produce pointer-to-pointer).
    fn at(doc: &'a [u8], pos: usize) -> Option<Value<'a>> {
        let mut pos = pos;
        let mut hops = 0;
        loop {
            let b0 = *doc.get(pos)?;
            if b0 & 0x80 != 0 {
                let b1 = *doc.get(pos + 1)?;
                let word = ((((b0 & 0x7f) as u16) << 8) | b1 as u16) & 0x7fff;
                let byte_off = (word as usize) * 2;
                let target = (pos + 2).checked_sub(byte_off)?;
                if target >= pos {
                    return None; // pointers must strictly decrease
                }
                pos = target;
                hops += 1;
                if hops > doc.len() {
                    return None; // cannot legitimately exceed buffer size
                }
            } else {
                return Some(Value { doc, pos });
            }
        }
    }

    pub(crate) fn doc(&self) -> &'a [u8] {
        self.doc
    }
    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    fn tag_byte(&self) -> u8 {
        self.doc[self.pos]
    }
    pub(crate) fn kind(&self) -> u8 {
        self.tag_byte() >> 4
    }
    fn low_nibble(&self) -> u8 {
        self.tag_byte() & 0x0f
    }

    pub fn value_type(&self) -> ValueType {
        match self.kind() {
            tag::SMALL_INT | tag::INT => ValueType::Int,
            tag::FLOAT => ValueType::Double,
            tag::SPECIAL => match self.low_nibble() {
                tag::SPECIAL_NULL => ValueType::Null,
                tag::SPECIAL_FALSE | tag::SPECIAL_TRUE => ValueType::Bool,
                _ => ValueType::Undefined,
            },
            tag::STRING => ValueType::String,
            tag::DATA => {
                if self.low_nibble() & tag::IS_BLOB_BIT != 0 {
                    ValueType::Blob
                } else {
                    ValueType::String
                }
            }
            tag::ARRAY => ValueType::Array,
            tag::DICT => ValueType::Dict,
            _ => ValueType::Undefined,
        }
    }

    pub fn as_bool(&self) -> bool {
        match self.value_type() {
            ValueType::Null | ValueType::Undefined => false,
            ValueType::Bool => self.low_nibble() == tag::SPECIAL_TRUE,
            ValueType::Int => self.as_int() != 0,
            ValueType::Double => self.as_double() != 0.0,
            _ => true,
        }
    }

    fn raw_int(&self) -> Option<(u64, usize, bool)> {
        match self.kind() {
            tag::SMALL_INT => {
                let nibble = self.low_nibble();
                Some((sign_extend_bits(nibble as u64, 4) as u64, 1, true))
            }
            tag::INT => {
                let signed = self.low_nibble() & 0x08 != 0;
                let byte_len = ((self.low_nibble() & 0x07) + 1) as usize;
                let bytes = self.doc.get(self.pos + 1..self.pos + 1 + byte_len)?;
                Some((be_bytes_to_u64(bytes), byte_len, signed))
            }
            _ => None,
        }
    }

    pub fn as_int(&self) -> i64 {
        match self.kind() {
            tag::SMALL_INT => sign_extend_bits((self.low_nibble() & 0x0f) as u64, 4),
            tag::INT => {
                if let Some((raw, byte_len, signed)) = self.raw_int() {
                    if signed {
                        sign_extend(raw, byte_len)
                    } else {
                        raw as i64
                    }
                } else {
                    0
                }
            }
            tag::FLOAT => self.as_double() as i64,
            _ => 0,
        }
    }

    pub fn as_unsigned(&self) -> u64 {
        match self.kind() {
            tag::SMALL_INT => self.as_int().max(0) as u64,
            tag::INT => self.raw_int().map(|(raw, _, _)| raw).unwrap_or(0),
            tag::FLOAT => self.as_double().max(0.0) as u64,
            _ => 0,
        }
    }

    pub fn as_double(&self) -> f64 {
        match self.kind() {
            tag::FLOAT => {
                if self.low_nibble() == 0 {
                    self.doc
                        .get(self.pos + 1..self.pos + 5)
                        .map(|b| f32::from_be_bytes(b.try_into().unwrap()) as f64)
                        .unwrap_or(0.0)
                } else {
                    self.doc
                        .get(self.pos + 1..self.pos + 9)
                        .map(|b| f64::from_be_bytes(b.try_into().unwrap()))
                        .unwrap_or(0.0)
                }
            }
            tag::SMALL_INT | tag::INT => self.as_int() as f64,
            _ => 0.0,
        }
    }

    pub fn as_float(&self) -> f32 {
        self.as_double() as f32
    }

    /// True if this float cell was written by `write_float` (4-byte f32
    /// storage) rather than `write_double` (8-byte f64 storage) — the low
    /// nibble of a `FLOAT`-tagged cell is 0 for f32, 1 for f64. Non-float
    /// values return `false`. Needed to pick the round-trip-safe digit
    /// count (6 vs 17 significant digits) when rendering to JSON text.
    pub fn is_float32(&self) -> bool {
        self.kind() == tag::FLOAT && self.low_nibble() == 0
    }

    fn short_string_bytes(&self) -> Option<&'a [u8]> {
        let len = self.low_nibble() as usize;
        self.doc.get(self.pos + 1..self.pos + 1 + len)
    }

    fn long_bytes(&self) -> Option<&'a [u8]> {
        let rest = self.doc.get(self.pos + 1..)?;
        let mut s = Slice::new(rest);
        let before = s.len();
        let len = s.read_uvarint()? as usize;
        let varint_len = before - s.len();
        let start = self.pos + 1 + varint_len;
        self.doc.get(start..start + len)
    }

    pub fn as_string(&self) -> &'a str {
        let bytes = match self.kind() {
            tag::STRING => self.short_string_bytes(),
            tag::DATA if self.low_nibble() & tag::IS_BLOB_BIT == 0 => self.long_bytes(),
            _ => None,
        };
        bytes.and_then(|b| std::str::from_utf8(b).ok()).unwrap_or("")
    }

    pub fn as_data(&self) -> &'a [u8] {
        match self.kind() {
            tag::STRING => self.short_string_bytes().unwrap_or(&[]),
            tag::DATA => self.long_bytes().unwrap_or(&[]),
            _ => &[],
        }
    }

    pub fn as_array(&self) -> Array<'a> {
        Array { val: *self }
    }

    pub fn as_dict(&self) -> Dict<'a> {
        Dict { val: *self }
    }

    /// Deep structural equality; dict key order doesn't matter.
    pub fn is_equal(&self, other: &Value) -> bool {
        let (t1, t2) = (self.value_type(), other.value_type());
        if t1 != t2 {
            // Allow cross-comparing numeric representations.
            return matches!(
                (t1, t2),
                (ValueType::Int, ValueType::Double) | (ValueType::Double, ValueType::Int)
            ) && self.as_double() == other.as_double();
        }
        match t1 {
            ValueType::Null | ValueType::Undefined => true,
            ValueType::Bool => self.as_bool() == other.as_bool(),
            ValueType::Int => self.as_int() == other.as_int(),
            ValueType::Double => self.as_double() == other.as_double(),
            ValueType::String => self.as_string() == other.as_string(),
            ValueType::Blob => self.as_data() == other.as_data(),
            ValueType::Array => {
                let (a, b) = (self.as_array(), other.as_array());
                a.count() == b.count()
                    && a.iter().zip(b.iter()).all(|(x, y)| x.is_equal(&y))
            }
            ValueType::Dict => {
                let (a, b) = (self.as_dict(), other.as_dict());
                if a.count() != b.count() {
                    return false;
                }
                a.iter(None).all(|e| match e.key_string(None) {
                    Some(k) => b
                        .get_unsorted(&k)
                        .map(|bv| bv.is_equal(&e.value))
                        .unwrap_or(false),
                    None => false,
                })
            }
        }
    }

    /// A canonical JSON-ish rendering of this value and its descendants.
    pub fn to_json_string(&self) -> String {
        let mut enc = crate::json_encoder::JSONEncoder::new(crate::json_encoder::JSONOptions {
            canonical: true,
            ..Default::default()
        });
        enc.write_value(self, None);
        enc.finish_string().unwrap_or_default()
    }
}

// ---------------------------------------------------------------- Array

#[derive(Clone, Copy)]
pub struct Array<'a> {
    val: Value<'a>,
}

impl<'a> Array<'a> {
    fn header(&self) -> (usize, u32) {
        if self.val.kind() != tag::ARRAY {
            return (2, 0);
        }
        read_count_header(self.val.doc, self.val.pos).unwrap_or((2, 0))
    }

    pub fn count(&self) -> u32 {
        self.header().1
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn get(&self, i: u32) -> Option<Value<'a>> {
        let (hdr, count) = self.header();
        if i >= count {
            return None;
        }
        let slot_pos = self.val.pos + hdr + 2 * (i as usize);
        Value::at(self.val.doc, slot_pos)
    }

    pub fn iter(&self) -> ArrayIter<'a> {
        ArrayIter {
            arr: *self,
            idx: 0,
        }
    }
}

pub struct ArrayIter<'a> {
    arr: Array<'a>,
    idx: u32,
}

impl<'a> Iterator for ArrayIter<'a> {
    type Item = Value<'a>;
    fn next(&mut self) -> Option<Value<'a>> {
        let v = self.arr.get(self.idx)?;
        self.idx += 1;
        Some(v)
    }
}

impl<'a> ArrayIter<'a> {
    pub fn count(&self) -> u32 {
        self.arr.count().saturating_sub(self.idx)
    }
}

impl<'a> IntoIterator for Array<'a> {
    type Item = Value<'a>;
    type IntoIter = ArrayIter<'a>;
    fn into_iter(self) -> ArrayIter<'a> {
        self.iter()
    }
}

// ----------------------------------------------------------------- Dict

#[derive(Clone, Copy)]
pub struct Dict<'a> {
    val: Value<'a>,
}

/// Whether a dict-entry key slot is a shared-key integer or a literal
/// string; shared-key integers always sort before strings (§4.5).
enum KeyView<'a> {
    Shared(u32),
    Str(&'a str),
    Other,
}

fn key_view<'a>(key: &Value<'a>) -> KeyView<'a> {
    match key.value_type() {
        ValueType::Int => KeyView::Shared(key.as_unsigned() as u32),
        ValueType::String => KeyView::Str(key.as_string()),
        _ => KeyView::Other,
    }
}

impl<'a> Dict<'a> {
    fn header(&self) -> (usize, u32) {
        if self.val.kind() != tag::DICT {
            return (2, 0);
        }
        read_count_header(self.val.doc, self.val.pos).unwrap_or((2, 0))
    }

    pub fn count(&self) -> u32 {
        self.header().1
    }
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    fn key_at(&self, i: u32, hdr: usize) -> Option<Value<'a>> {
        let pos = self.val.pos + hdr + 4 * (i as usize);
        Value::at(self.val.doc, pos)
    }
    fn val_at(&self, i: u32, hdr: usize) -> Option<Value<'a>> {
        let pos = self.val.pos + hdr + 4 * (i as usize) + 2;
        Value::at(self.val.doc, pos)
    }

    /// Binary search assuming string keys are sorted and any shared-key
    /// integer slots sort before them (so they're skipped, never matched,
    /// when no SharedKeys table is supplied).
    fn binary_search_str(&self, target: &str) -> Option<u32> {
        let (hdr, count) = self.header();
        if count == 0 {
            return None;
        }
        let (mut lo, mut hi) = (0i64, count as i64 - 1);
        while lo <= hi {
            let mid = (lo + hi) / 2;
            let key = self.key_at(mid as u32, hdr)?;
            match key_view(&key) {
                KeyView::Str(s) => match s.cmp(target) {
                    Ordering::Less => lo = mid + 1,
                    Ordering::Greater => hi = mid - 1,
                    Ordering::Equal => return Some(mid as u32),
                },
                // Shared-key ints sort before every string; target (a
                // string) is always greater.
                KeyView::Shared(_) | KeyView::Other => lo = mid + 1,
            }
        }
        None
    }

    fn linear_search_str(&self, target: &str) -> Option<u32> {
        let (hdr, count) = self.header();
        for i in 0..count {
            if let Some(key) = self.key_at(i, hdr) {
                if let KeyView::Str(s) = key_view(&key) {
                    if s == target {
                        return Some(i);
                    }
                }
            }
        }
        None
    }

    fn binary_search_code(&self, target: u32) -> Option<u32> {
        let (hdr, count) = self.header();
        if count == 0 {
            return None;
        }
        let (mut lo, mut hi) = (0i64, count as i64 - 1);
        while lo <= hi {
            let mid = (lo + hi) / 2;
            let key = self.key_at(mid as u32, hdr)?;
            match key_view(&key) {
                KeyView::Shared(c) => match c.cmp(&target) {
                    Ordering::Less => lo = mid + 1,
                    Ordering::Greater => hi = mid - 1,
                    Ordering::Equal => return Some(mid as u32),
                },
                // Strings sort after every shared-key int.
                KeyView::Str(_) | KeyView::Other => hi = mid - 1,
            }
        }
        None
    }

    fn linear_search_code(&self, target: u32) -> Option<u32> {
        let (hdr, count) = self.header();
        for i in 0..count {
            if let Some(key) = self.key_at(i, hdr) {
                if let KeyView::Shared(c) = key_view(&key) {
                    if c == target {
                        return Some(i);
                    }
                }
            }
        }
        None
    }

    /// Binary search first (valid when the dict was encoded with
    /// `sort_keys`), falling back to a linear scan otherwise.
    pub fn get(&self, key: &str) -> Option<Value<'a>> {
        let (hdr, _) = self.header();
        let idx = self.binary_search_str(key).or_else(|| self.linear_search_str(key))?;
        self.val_at(idx, hdr)
    }

    pub fn get_unsorted(&self, key: &str) -> Option<Value<'a>> {
        let (hdr, _) = self.header();
        let idx = self.linear_search_str(key)?;
        self.val_at(idx, hdr)
    }

    /// `get` or `get_with_shared_keys`, depending on whether `sk` is
    /// supplied; a convenience for call sites (Path, JSONPointer) that
    /// carry an optional shared-keys table.
    pub fn get_opt(&self, key: &str, sk: Option<&SharedKeys>) -> Option<Value<'a>> {
        match sk {
            Some(sk) => self.get_with_shared_keys(key, sk),
            None => self.get(key),
        }
    }

    /// Tries the shared-key path first, then falls back to a plain string
    /// lookup (which only ever matches literal string-keyed slots).
    pub fn get_with_shared_keys(&self, key: &str, sk: &SharedKeys) -> Option<Value<'a>> {
        let (hdr, _) = self.header();
        if let Some(code) = sk.encode_lookup_only(key) {
            if let Some(idx) = self
                .binary_search_code(code)
                .or_else(|| self.linear_search_code(code))
            {
                return self.val_at(idx, hdr);
            }
        }
        self.get(key)
    }

    /// Merge-join: given a *sorted, unique* key array, walks the dict and
    /// the query array in lockstep in one O(|dict|+n) pass.
    pub fn get_multi(&self, keys: &[&str], out: &mut [Option<Value<'a>>]) -> usize {
        assert_eq!(keys.len(), out.len());
        let (hdr, count) = self.header();
        let mut i = 0u32;
        let mut k = 0usize;
        let mut found = 0;
        while i < count && k < keys.len() {
            let Some(key) = self.key_at(i, hdr) else {
                i += 1;
                continue;
            };
            match key_view(&key) {
                KeyView::Str(s) => match s.cmp(keys[k]) {
                    Ordering::Less => i += 1,
                    Ordering::Greater => k += 1,
                    Ordering::Equal => {
                        out[k] = self.val_at(i, hdr);
                        found += 1;
                        i += 1;
                        k += 1;
                    }
                },
                _ => i += 1,
            }
        }
        found
    }

    pub fn iter(&self, sk: Option<&'a SharedKeys>) -> DictIter<'a> {
        DictIter {
            dict: *self,
            idx: 0,
            sk,
        }
    }

    /// Binds (or rebinds) a prepared key against this dict, returning the
    /// resolved value. See [`DictKey`] for the caching contract.
    pub fn get_prepared(&self, pkey: &DictKey) -> Option<Value<'a>> {
        let identity = (self.val.doc.as_ptr() as usize, self.val.doc.len(), self.val.pos);
        if let Some((cached_identity, slot)) = pkey.cache.get() {
            if cached_identity == identity {
                return Value::at(self.val.doc, slot);
            }
        }
        let (hdr, _) = self.header();
        let idx = self
            .binary_search_str(&pkey.key)
            .or_else(|| self.linear_search_str(&pkey.key))?;
        let slot_pos = self.val.pos + hdr + 4 * (idx as usize) + 2;
        pkey.cache.set(Some((identity, slot_pos)));
        Value::at(self.val.doc, slot_pos)
    }
}

impl<'a> IntoIterator for Dict<'a> {
    type Item = DictEntry<'a>;
    type IntoIter = DictIter<'a>;
    fn into_iter(self) -> DictIter<'a> {
        self.iter(None)
    }
}

/// A pre-hashed, position-cached dictionary key query (§4.4). The first
/// lookup against a given container records the slot offset; subsequent
/// lookups against the *same* container (detected by comparing the
/// container's identity to the cached one) return it in O(1).
pub struct DictKey {
    key: String,
    hash: u64,
    cache: Cell<Option<((usize, usize, usize), usize)>>,
}

impl DictKey {
    pub fn new(key: &str) -> Self {
        DictKey {
            key: key.to_string(),
            hash: Slice::from(key).hash(),
            cache: Cell::new(None),
        }
    }
    pub fn as_str(&self) -> &str {
        &self.key
    }
    pub fn hash(&self) -> u64 {
        self.hash
    }
}

pub struct DictIter<'a> {
    dict: Dict<'a>,
    idx: u32,
    sk: Option<&'a SharedKeys>,
}

pub struct DictEntry<'a> {
    pub key: Value<'a>,
    pub value: Value<'a>,
    sk: Option<&'a SharedKeys>,
}

impl<'a> DictEntry<'a> {
    /// Resolves this entry's key to a string, decoding a shared-key
    /// integer via `sk` (falling back to the iterator's own table when
    /// `sk` is `None`).
    pub fn key_string(&self, sk: Option<&SharedKeys>) -> Option<String> {
        match key_view(&self.key) {
            KeyView::Str(s) => Some(s.to_string()),
            KeyView::Shared(code) => sk.or(self.sk).and_then(|s| s.decode(code)),
            KeyView::Other => None,
        }
    }
}

impl<'a> Iterator for DictIter<'a> {
    type Item = DictEntry<'a>;
    fn next(&mut self) -> Option<DictEntry<'a>> {
        let (hdr, count) = self.dict.header();
        if self.idx >= count {
            return None;
        }
        let key = self.dict.key_at(self.idx, hdr)?;
        let value = self.dict.val_at(self.idx, hdr)?;
        self.idx += 1;
        Some(DictEntry {
            key,
            value,
            sk: self.sk,
        })
    }
}
impl<'a> DictIter<'a> {
    pub fn count(&self) -> u32 {
        self.dict.count().saturating_sub(self.idx)
    }
}

// ------------------------------------------------------------ validation

/// Recursively validates that every pointer target lies within
/// `[0, pointer_position)`, every tag is recognized, and every cell is
/// 2-byte aligned and in-bounds. `limit` is the exclusive upper bound a
/// pointer chased from `pos` is allowed to land within (enforces
/// backwards-only references).
fn validate_cell(doc: &[u8], pos: usize, limit: usize) -> Result<()> {
    if pos >= limit || pos + 1 >= doc.len() {
        return Err(err(ErrorKind::InvalidData, "cell out of range"));
    }
    let b0 = doc[pos];
    if b0 & 0x80 != 0 {
        let b1 = doc[pos + 1];
        let word = ((((b0 & 0x7f) as u16) << 8) | b1 as u16) & 0x7fff;
        let byte_off = (word as usize) * 2;
        let target = (pos + 2)
            .checked_sub(byte_off)
            .ok_or_else(|| err(ErrorKind::InvalidData, "pointer underflow"))?;
        if target >= pos {
            return Err(err(ErrorKind::InvalidData, "pointer does not go backwards"));
        }
        return validate_cell(doc, target, pos);
    }
    let kind = b0 >> 4;
    let low = b0 & 0x0f;
    match kind {
        tag::SMALL_INT => Ok(()),
        tag::INT => {
            let byte_len = ((low & 0x07) + 1) as usize;
            if pos + 1 + byte_len > doc.len() {
                return Err(err(ErrorKind::InvalidData, "int payload out of range"));
            }
            Ok(())
        }
        tag::FLOAT => {
            let n = if low == 0 { 4 } else if low == 1 { 8 } else {
                return Err(err(ErrorKind::UnknownValue, "bad float width"));
            };
            if pos + 1 + n > doc.len() {
                return Err(err(ErrorKind::InvalidData, "float payload out of range"));
            }
            Ok(())
        }
        tag::SPECIAL => {
            if low > tag::SPECIAL_TRUE {
                return Err(err(ErrorKind::UnknownValue, "bad special value"));
            }
            Ok(())
        }
        tag::STRING => {
            let len = low as usize;
            if pos + 1 + len > doc.len() {
                return Err(err(ErrorKind::InvalidData, "string payload out of range"));
            }
            Ok(())
        }
        tag::DATA => {
            let rest = doc.get(pos + 1..).ok_or_else(|| err(ErrorKind::InvalidData, "truncated"))?;
            let mut s = Slice::new(rest);
            let before = s.len();
            let len = s
                .read_uvarint()
                .ok_or_else(|| err(ErrorKind::InvalidData, "bad varint length"))? as usize;
            let varint_len = before - s.len();
            if pos + 1 + varint_len + len > doc.len() {
                return Err(err(ErrorKind::InvalidData, "blob/string payload out of range"));
            }
            Ok(())
        }
        tag::ARRAY => {
            let (hdr, count) = read_count_header(doc, pos)
                .ok_or_else(|| err(ErrorKind::InvalidData, "bad array header"))?;
            let end = pos + hdr + 2 * count as usize;
            if end > doc.len() {
                return Err(err(ErrorKind::InvalidData, "array slots out of range"));
            }
            for i in 0..count {
                validate_cell(doc, pos + hdr + 2 * i as usize, pos + hdr + 2 * i as usize + 2)?;
            }
            Ok(())
        }
        tag::DICT => {
            let (hdr, count) = read_count_header(doc, pos)
                .ok_or_else(|| err(ErrorKind::InvalidData, "bad dict header"))?;
            let end = pos + hdr + 4 * count as usize;
            if end > doc.len() {
                return Err(err(ErrorKind::InvalidData, "dict slots out of range"));
            }
            for i in 0..count {
                let kpos = pos + hdr + 4 * i as usize;
                validate_cell(doc, kpos, kpos + 2)?;
                validate_cell(doc, kpos + 2, kpos + 4)?;
            }
            Ok(())
        }
        _ => Err(err(ErrorKind::UnknownValue, "reserved tag")),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::encoder::{Encoder, EncoderOptions};
    use test_log::test;

    fn encode_simple() -> Vec<u8> {
        let mut enc = Encoder::new(EncoderOptions {
            sort_keys: true,
            ..Default::default()
        });
        enc.begin_dict(Some(1)).unwrap();
        enc.write_key("hi").unwrap();
        enc.write_int(123).unwrap();
        enc.end_dict().unwrap();
        enc.extract_output().unwrap()
    }

    #[test]
    fn test_decode_simple_dict() {
        let buf = encode_simple();
        let root = Value::from_data(&buf).unwrap();
        assert_eq!(root.value_type(), ValueType::Dict);
        let d = root.as_dict();
        assert_eq!(d.count(), 1);
        let v = d.get("hi").unwrap();
        assert_eq!(v.as_int(), 123);
        assert_eq!(d.get("nope"), None);
    }

    #[test]
    fn test_trusted_matches_validated() {
        let buf = encode_simple();
        let trusted = Value::from_trusted_data(&buf);
        let checked = Value::from_data(&buf).unwrap();
        assert!(trusted.is_equal(&checked));
    }

    #[test]
    fn test_array_roundtrip() {
        let mut enc = Encoder::new(EncoderOptions::default());
        enc.begin_array(Some(3)).unwrap();
        enc.write_int(10).unwrap();
        enc.write_int(20).unwrap();
        enc.write_int(30).unwrap();
        enc.end_array().unwrap();
        let buf = enc.extract_output().unwrap();
        let root = Value::from_data(&buf).unwrap();
        let a = root.as_array();
        assert_eq!(a.count(), 3);
        assert_eq!(a.get(0).unwrap().as_int(), 10);
        assert_eq!(a.get(2).unwrap().as_int(), 30);
        assert_eq!(a.get(3), None);
        let vals: Vec<i64> = a.iter().map(|v| v.as_int()).collect();
        assert_eq!(vals, vec![10, 20, 30]);
    }

    #[test]
    fn test_get_multi_matches_repeated_get() {
        let mut enc = Encoder::new(EncoderOptions {
            sort_keys: true,
            ..Default::default()
        });
        enc.begin_dict(Some(3)).unwrap();
        for (k, v) in [("a", 1), ("b", 2), ("c", 3)] {
            enc.write_key(k).unwrap();
            enc.write_int(v).unwrap();
        }
        enc.end_dict().unwrap();
        let buf = enc.extract_output().unwrap();
        let root = Value::from_data(&buf).unwrap();
        let d = root.as_dict();
        let keys = ["a", "b", "d"];
        let mut out = [None, None, None];
        let n = d.get_multi(&keys, &mut out);
        assert_eq!(n, 2);
        assert_eq!(out[0].unwrap().as_int(), 1);
        assert_eq!(out[1].unwrap().as_int(), 2);
        assert!(out[2].is_none());
        for k in keys {
            let expect = d.get(k).map(|v| v.as_int());
            let got = match k {
                "a" => out[0].map(|v| v.as_int()),
                "b" => out[1].map(|v| v.as_int()),
                "d" => out[2].map(|v| v.as_int()),
                _ => unreachable!(),
            };
            assert_eq!(expect, got);
        }
    }

    #[test]
    fn test_shared_keys_transparency() {
        let sk = SharedKeys::new();
        sk.encode("name").unwrap();
        sk.encode("age").unwrap();
        let mut enc = Encoder::new(EncoderOptions {
            sort_keys: true,
            ..Default::default()
        });
        enc.set_shared_keys(&sk);
        enc.begin_dict(Some(2)).unwrap();
        enc.write_key("name").unwrap();
        enc.write_string("Jo").unwrap();
        enc.write_key("age").unwrap();
        enc.write_int(30).unwrap();
        enc.end_dict().unwrap();
        let buf = enc.extract_output().unwrap();
        let root = Value::from_data(&buf).unwrap();
        let d = root.as_dict();
        assert_eq!(d.get_with_shared_keys("name", &sk).unwrap().as_string(), "Jo");
        assert_eq!(d.get("name"), None);
    }

    #[test]
    fn test_prepared_key_cache() {
        let buf = encode_simple();
        let root = Value::from_data(&buf).unwrap();
        let d = root.as_dict();
        let pkey = DictKey::new("hi");
        assert_eq!(d.get_prepared(&pkey).unwrap().as_int(), 123);
        // Second lookup should hit the cache and still be correct.
        assert_eq!(d.get_prepared(&pkey).unwrap().as_int(), 123);
    }
}
