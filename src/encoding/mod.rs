//! Serialization helpers for transaction payloads and snapshot bodies.
//!
//! Framing (lengths, checksums, headers) is done by hand with `byteorder` in
//! the log modules. The contents inside a frame are serde types encoded with
//! bincode.

pub mod bincode;
