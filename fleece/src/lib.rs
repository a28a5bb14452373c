//! Fleece: a binary encoding of JSON-compatible values designed for
//! zero-parse random access. A previously encoded buffer can be indexed,
//! looked up by key, and walked directly, without first materializing a
//! tree of heap objects.

pub mod deep_iterator;
pub mod encoder;
pub mod json_converter;
pub mod json_encoder;
pub mod path;
pub mod shared_keys;
pub mod slice;
pub mod value;
mod writer;

pub use deep_iterator::{DeepIterator, PathComponent};
pub use encoder::{Encoder, EncoderOptions};
pub use fleece_base::{err, Error, ErrorKind, Result};
pub use json_converter::JSONConverter;
pub use json_encoder::{JSONEncoder, JSONOptions};
pub use path::Path;
pub use shared_keys::SharedKeys;
pub use slice::Slice;
pub use value::{Array, ArrayIter, Dict, DictEntry, DictIter, DictKey, Value, ValueType};
pub use writer::Writer;
