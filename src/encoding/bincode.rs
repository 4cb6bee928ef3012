use crate::error::Result;
use crate::Error;
use serde::{de::DeserializeOwned, Serialize};

/// Serialize a value using bincode. `what` names the value in errors.
pub fn serialize<T: Serialize + ?Sized>(what: &'static str, value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Encode(what, e.to_string()))
}

/// Deserialize a value from a byte slice. Trailing bytes are rejected so a
/// payload that decodes "by accident" is still reported as corrupt.
pub fn deserialize<T: DeserializeOwned>(what: &'static str, bytes: &[u8]) -> Result<T> {
    let mut cursor = std::io::Cursor::new(bytes);
    let value = bincode::deserialize_from(&mut cursor).map_err(|e| Error::Decode(what, e.to_string()))?;
    if cursor.position() as usize != bytes.len() {
        return Err(Error::Decode(
            what,
            format!(
                "{} trailing bytes after value",
                bytes.len() - cursor.position() as usize
            ),
        ));
    }
    Ok(value)
}
