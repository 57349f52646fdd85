//! Bencode encoding and decoding ([BEP-3]).
//!
//! Bencode is the self-describing serialization format used for torrent
//! metadata and for the dictionaries exchanged by the extension protocol.
//!
//! # Data Types
//!
//! | Type | Format | Example |
//! |------|--------|---------|
//! | Integer | `i<number>e` | `i42e` → 42 |
//! | Byte String | `<length>:<data>` | `4:spam` → "spam" |
//! | List | `l<items>e` | `l4:spami42ee` → ["spam", 42] |
//! | Dictionary | `d<key><value>...e` | `d3:foo3:bare` → {"foo": "bar"} |
//!
//! Byte string lengths count bytes, not characters, and the contents are kept
//! as raw bytes. Dictionaries keep the key order they were built or read with.
//!
//! # Examples
//!
//! ```
//! use peerwire::bencode::{decode, encode, Dict, Value};
//!
//! let value = decode(b"d3:foo3:bare").unwrap();
//! assert_eq!(value.get(b"foo").and_then(|v| v.as_str()), Some("bar"));
//!
//! let mut m = Dict::new();
//! m.insert("ut_metadata", Value::Integer(1));
//! let mut handshake = Dict::new();
//! handshake.insert("m", Value::Dict(m));
//! assert_eq!(encode(&Value::Dict(handshake)), b"d1:md11:ut_metadatai1eee");
//! ```
//!
//! # Error Handling
//!
//! Decoding can fail for various reasons:
//!
//! - [`BencodeError::UnexpectedEof`] - Input ended inside a value
//! - [`BencodeError::InvalidInteger`] - Malformed integer (e.g., leading zeros)
//! - [`BencodeError::InvalidStringLength`] - Non-numeric byte string length
//! - [`BencodeError::UnexpectedChar`] - Unexpected character in input
//! - [`BencodeError::DuplicateKey`] - A dictionary repeats a key
//! - [`BencodeError::NestingTooDeep`] - Recursion limit exceeded (max 64 levels)
//! - [`BencodeError::TrailingData`] - Extra data after the value
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

mod decode;
mod encode;
mod error;
mod value;

pub use decode::{decode, decode_prefix};
pub use encode::{encode, encode_into};
pub use error::BencodeError;
pub use value::{Dict, Value};
