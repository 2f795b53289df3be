//! UDP datagram codec
//!
//! Layouts, little-endian:
//!
//! | datagram | layout |
//! |---|---|
//! | subscribe | `"RREF\0"`, frequency (i32), index (i32), name NUL-padded to 400 bytes |
//! | values | `"RREF,"`, then `(index i32, value f32)` pairs |
//! | write | `"DREF\0"`, value (4 bytes), name NUL-terminated and space-padded to 500 bytes |
//! | command | `"CMND\0"`, command name |
//!
//! A subscribe request with frequency 0 cancels the subscription for its index.

use crate::types::Value;
use crate::{LinkError, Result};

pub const RREF_MAGIC: &[u8; 5] = b"RREF\0";
pub const DREF_MAGIC: &[u8; 5] = b"DREF\0";
pub const CMND_MAGIC: &[u8; 5] = b"CMND\0";

/// Width of the name field of a subscribe request.
pub const RREF_NAME_LEN: usize = 400;
pub const RREF_REQUEST_LEN: usize = 5 + 4 + 4 + RREF_NAME_LEN;

/// Width of the name field of a write.
pub const DREF_NAME_LEN: usize = 500;
pub const DREF_LEN: usize = 5 + 4 + DREF_NAME_LEN;

/// Largest datagram the simulator sends.
pub const MAX_DATAGRAM_LEN: usize = 1472;

const VALUE_PAIR_LEN: usize = 8;

/// Subscribe (or, at frequency 0, unsubscribe) request for one dataref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RrefRequest {
    /// Updates per second
    pub frequency: i32,
    /// Caller-chosen index echoed back with every value
    pub index: i32,
    pub name: String,
}

impl RrefRequest {
    pub fn encode(&self) -> Result<Vec<u8>> {
        check_name(&self.name, RREF_NAME_LEN)?;
        let mut bytes = Vec::with_capacity(RREF_REQUEST_LEN);
        bytes.extend_from_slice(RREF_MAGIC);
        bytes.extend_from_slice(&self.frequency.to_le_bytes());
        bytes.extend_from_slice(&self.index.to_le_bytes());
        bytes.extend_from_slice(self.name.as_bytes());
        bytes.resize(RREF_REQUEST_LEN, 0);
        Ok(bytes)
    }

    /// Decode a request, as the simulator would.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != RREF_REQUEST_LEN || &bytes[0..5] != RREF_MAGIC {
            return Err(LinkError::malformed("not an RREF request", bytes.len()));
        }
        let frequency = i32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
        let index = i32::from_le_bytes([bytes[9], bytes[10], bytes[11], bytes[12]]);
        Ok(Self { frequency, index, name: nul_terminated(&bytes[13..]) })
    }
}

/// Decode a values datagram into `(index, value)` pairs.
///
/// Values in `(-0.001, 0)` are reported as `0.0`; the simulator sends tiny
/// negative values for quantities that are zero. A trailing partial pair is
/// ignored.
pub fn decode_values(bytes: &[u8]) -> Result<Vec<(i32, f32)>> {
    if bytes.len() < 5 || &bytes[0..4] != b"RREF" {
        return Err(LinkError::malformed("not an RREF values datagram", bytes.len()));
    }
    Ok(bytes[5..]
        .chunks_exact(VALUE_PAIR_LEN)
        .map(|pair| {
            let index = i32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]);
            let value = f32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]);
            (index, if value < 0.0 && value > -0.001 { 0.0 } else { value })
        })
        .collect())
}

/// Encode a values datagram, as the simulator would.
pub fn encode_values(values: &[(i32, f32)]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(5 + values.len() * VALUE_PAIR_LEN);
    bytes.extend_from_slice(b"RREF,");
    for (index, value) in values {
        bytes.extend_from_slice(&index.to_le_bytes());
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Value carried by a write. The simulator reads the 4 bytes according to
/// the dataref's own type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DrefValue {
    Float(f32),
    Int(i32),
    Bool(bool),
}

impl DrefValue {
    fn to_le_bytes(self) -> [u8; 4] {
        match self {
            DrefValue::Float(v) => v.to_le_bytes(),
            DrefValue::Int(v) => v.to_le_bytes(),
            DrefValue::Bool(v) => u32::from(v).to_le_bytes(),
        }
    }
}

impl TryFrom<&Value> for DrefValue {
    type Error = LinkError;

    fn try_from(value: &Value) -> Result<Self> {
        match value {
            Value::Float(v) => Ok(DrefValue::Float(*v as f32)),
            Value::Int(v) => i32::try_from(*v)
                .map(DrefValue::Int)
                .map_err(|_| LinkError::decode("UDP write", format!("{} does not fit 32 bits", v))),
            other => Err(LinkError::decode("UDP write", format!("{:?} is not a scalar number", other))),
        }
    }
}

/// Write of one dataref value.
#[derive(Debug, Clone, PartialEq)]
pub struct DrefWrite {
    pub value: DrefValue,
    pub name: String,
}

impl DrefWrite {
    pub fn encode(&self) -> Result<Vec<u8>> {
        check_name(&self.name, DREF_NAME_LEN)?;
        let mut bytes = Vec::with_capacity(DREF_LEN);
        bytes.extend_from_slice(DREF_MAGIC);
        bytes.extend_from_slice(&self.value.to_le_bytes());
        bytes.extend_from_slice(self.name.as_bytes());
        bytes.push(0);
        bytes.resize(DREF_LEN, b' ');
        Ok(bytes)
    }
}

/// Single command invocation.
pub fn encode_command(name: &str) -> Result<Vec<u8>> {
    check_name(name, MAX_DATAGRAM_LEN - CMND_MAGIC.len())?;
    let mut bytes = Vec::with_capacity(CMND_MAGIC.len() + name.len());
    bytes.extend_from_slice(CMND_MAGIC);
    bytes.extend_from_slice(name.as_bytes());
    Ok(bytes)
}

/// Names need room for their NUL terminator and cannot contain one.
fn check_name(name: &str, field: usize) -> Result<()> {
    if name.is_empty() {
        return Err(LinkError::invalid_name(name, "empty"));
    }
    if name.as_bytes().contains(&0) {
        return Err(LinkError::invalid_name(name, "contains NUL"));
    }
    if name.len() >= field {
        return Err(LinkError::invalid_name(name, format!("longer than {} bytes", field - 1)));
    }
    Ok(())
}

fn nul_terminated(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
