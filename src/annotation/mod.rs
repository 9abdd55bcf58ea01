//! Annotation encoding.
//!
//! Annotations arrive as a serialized message that may only contain enum
//! fields, in the protobuf wire layout: a key byte `field_number << 3`
//! (wire type 0) followed by a base-128 varint value. Absent fields are simply
//! left out, and value 0 is never written.
//!
//! An annotation is packed into a single integer by reading the field values
//! as digits of a mixed-radix number. Each field reserves one extra value for
//! "absent", so with
//!
//! ```text
//! enum A { A_1 = 1, A_2 = 2, A_3 = 3 }
//! enum B { B_1 = 1, B_2 = 2 }
//! message Annotation { optional A a = 1; optional B b = 2; }
//! ```
//!
//! the radix table is `[4, 4*3] = [4, 12]`, `b: B_1` encodes as `0x10 0x01`
//! and packs to `1 * 4 = 4`. There are 12 possible annotations in total.

pub mod descriptor;

use crate::core::{AnnotationId, Result, SerializedAnnotation, TuningForkError};

/// Largest value accepted for any single annotation field.
pub const MAX_FIELD_VALUE: u64 = 0xff;

/// An annotation id together with its loading state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedAnnotation {
    /// Packed annotation
    pub id: AnnotationId,
    /// The loading field carried a value above 1
    pub loading: bool,
}

/// 1-based field number from a key byte, if the wire type is varint.
fn field_number(key: u8) -> Option<u32> {
    if key & 0x7 != 0 {
        return None;
    }
    match key >> 3 {
        0 => None,
        n => Some(u32::from(n)),
    }
}

/// Read a base-128 varint starting at `pos`, leaving `pos` after its last byte.
///
/// Returns `None` if the stream ends mid-varint or the value needs more than
/// ten bytes.
pub fn read_varint(bytes: &[u8], pos: &mut usize) -> Option<u64> {
    let mut shift = 0u32;
    let mut result = 0u64;
    while let Some(&b) = bytes.get(*pos) {
        if shift > 63 {
            return None;
        }
        result |= u64::from(b & 0x7f) << shift;
        *pos += 1;
        if b & 0x80 == 0 {
            return Some(result);
        }
        shift += 7;
    }
    None
}

/// Append `x` as a base-128 varint.
pub fn write_varint(mut x: u64, out: &mut Vec<u8>) {
    loop {
        let low = (x & 0x7f) as u8;
        x >>= 7;
        if x == 0 {
            out.push(low);
            return;
        }
        out.push(low | 0x80);
    }
}

/// Decode into `(field_number, value)` pairs without range checks.
/// Field numbers are 1-based, as in the message definition.
pub fn raw_decode_annotation_serialization(ser: &[u8]) -> Result<Vec<(u32, u64)>> {
    let mut fields = Vec::new();
    let mut pos = 0;
    while pos < ser.len() {
        let key = ser[pos];
        let number = field_number(key)
            .ok_or_else(|| TuningForkError::annotation(format!("bad key byte {key:#04x}")))?;
        pos += 1;
        let value = read_varint(ser, &mut pos).ok_or_else(|| {
            TuningForkError::annotation(format!("truncated value for field {number}"))
        })?;
        fields.push((number, value));
    }
    Ok(fields)
}

/// Build the cumulative radix table from the cardinality of each field.
///
/// `radix_mult[i] = (enum_sizes[0] + 1) * ... * (enum_sizes[i] + 1)`. With no
/// fields there is exactly one annotation, the empty one.
pub fn set_up_annotation_radixes(enum_sizes: &[u32]) -> Vec<u32> {
    if enum_sizes.is_empty() {
        return vec![1];
    }
    let mut radix_mult = Vec::with_capacity(enum_sizes.len());
    let mut r = 1u32;
    for &size in enum_sizes {
        r = r.saturating_mul(size.saturating_add(1));
        radix_mult.push(r);
    }
    tracing::debug!("Annotation enum sizes {:?} -> radixes {:?}", enum_sizes, radix_mult);
    radix_mult
}

/// Multiplier of field `index` (the product of all lower radixes).
fn field_multiplier(radix_mult: &[u32], index: usize) -> u64 {
    if index == 0 {
        1
    } else {
        u64::from(radix_mult[index - 1])
    }
}

/// Declared cardinality of field `index`.
fn field_cardinality(radix_mult: &[u32], index: usize) -> u64 {
    u64::from(radix_mult[index]) / field_multiplier(radix_mult, index) - 1
}

/// Decode a serialized annotation into its packed id.
///
/// When `loading_index` names a field whose value is above 1 the annotation is
/// considered to be a loading screen and only the loading and `level_index`
/// fields contribute to the returned id.
pub fn decode_annotation_serialization(
    ser: &[u8],
    radix_mult: &[u32],
    loading_index: Option<usize>,
    level_index: Option<usize>,
) -> Result<DecodedAnnotation> {
    let mut id: AnnotationId = 0;
    let mut id_if_loading: AnnotationId = 0;
    let mut loading = false;
    let mut seen = 0u64;
    for (number, value) in raw_decode_annotation_serialization(ser)? {
        let index = (number - 1) as usize;
        if index >= radix_mult.len() {
            return Err(TuningForkError::annotation(format!(
                "field {number} beyond the {} declared fields",
                radix_mult.len()
            )));
        }
        if seen & (1 << index) != 0 {
            return Err(TuningForkError::annotation(format!("field {number} repeated")));
        }
        seen |= 1 << index;
        if value == 0 {
            return Err(TuningForkError::annotation(format!("explicit zero for field {number}")));
        }
        if value > field_cardinality(radix_mult, index) || value > MAX_FIELD_VALUE {
            return Err(TuningForkError::annotation(format!(
                "value {value} out of range for field {number}"
            )));
        }
        let v = field_multiplier(radix_mult, index) * value;
        id += v;
        if loading_index == Some(index) {
            loading = value > 1;
        }
        if loading_index == Some(index) || level_index == Some(index) {
            id_if_loading += v;
        }
    }
    Ok(DecodedAnnotation {
        id: if loading { id_if_loading } else { id },
        loading,
    })
}

/// Re-encode a packed id, omitting fields whose value is 0.
pub fn serialize_annotation_id(id: AnnotationId, radix_mult: &[u32]) -> SerializedAnnotation {
    let n = radix_mult.len();
    let mut values = vec![0u64; n];
    let mut x = id;
    for i in (1..n).rev() {
        let m = u64::from(radix_mult[i - 1]);
        values[i] = x / m;
        x %= m;
    }
    if n > 0 {
        values[0] = x;
    }
    let mut ser = Vec::new();
    for (i, &value) in values.iter().enumerate() {
        if value > 0 {
            ser.push(((i + 1) << 3) as u8);
            write_varint(value, &mut ser);
        }
    }
    ser
}

/// Value of a single field of a packed id.
pub fn value(id: AnnotationId, index: usize, radix_mult: &[u32]) -> Result<u32> {
    if index >= radix_mult.len() {
        return Err(TuningForkError::BadIndex {
            index,
            len: radix_mult.len(),
        });
    }
    let v = (id % u64::from(radix_mult[index])) / field_multiplier(radix_mult, index);
    Ok(v as u32)
}
