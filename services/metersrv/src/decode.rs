//! Register decode and scaling
//!
//! Pure functions from raw holding-register words to engineering values.
//! 32-bit quantities always occupy two consecutive registers with the high
//! word first (ABCD order); the composed integer is divided by the field's
//! scale, 65536 unless overridden.

use std::collections::BTreeMap;

use crate::error::{MeterSrvError, Result};
use crate::layout::{DecodeKind, FieldDescriptor, FieldLayout, DEFAULT_SCALE};
use crate::reader::RawBlockSet;
use crate::snapshot::FieldValue;

/// Compose a high/low register pair into one u32, high word most significant
#[inline]
pub fn compose_u32(high: u16, low: u16) -> u32 {
    (u32::from(high) << 16) | u32::from(low)
}

/// Unsigned 32-bit pair divided by the default scale
#[inline]
pub fn decode_unsigned32(high: u16, low: u16) -> f64 {
    f64::from(compose_u32(high, low)) / DEFAULT_SCALE
}

/// Two's-complement 32-bit pair divided by the default scale
#[inline]
pub fn decode_signed32(high: u16, low: u16) -> f64 {
    f64::from(compose_u32(high, low) as i32) / DEFAULT_SCALE
}

/// Decode a single field from its block's words
pub fn decode_field(words: &[u16], field: &FieldDescriptor) -> Result<f64> {
    let start = usize::from(field.offset);
    let width = usize::from(field.kind.word_width());
    let slice = words.get(start..start + width).ok_or_else(|| {
        MeterSrvError::decode(format!(
            "field '{}' needs words {}..{} but block has {}",
            field.name,
            start,
            start + width,
            words.len()
        ))
    })?;

    let value = match field.kind {
        DecodeKind::Raw => f64::from(slice[0]),
        DecodeKind::Unsigned32 => {
            f64::from(compose_u32(slice[0], slice[1])) / field.effective_scale()
        },
        DecodeKind::Signed32 => {
            f64::from(compose_u32(slice[0], slice[1]) as i32) / field.effective_scale()
        },
    };
    Ok(value)
}

/// Decode every field of `layout` from one cycle's raw blocks.
///
/// A missing block or a block shorter than declared is a
/// [`MeterSrvError::DecodeError`]; layouts validated by [`FieldLayout::new`]
/// together with a complete [`RawBlockSet`] never produce one.
pub fn decode(raw: &RawBlockSet, layout: &FieldLayout) -> Result<BTreeMap<String, FieldValue>> {
    let mut values = BTreeMap::new();

    for field in layout.fields() {
        let block = layout.blocks().get(field.block).ok_or_else(|| {
            MeterSrvError::decode(format!(
                "field '{}' references missing block {}",
                field.name, field.block
            ))
        })?;
        let words = raw.get(block.start).ok_or_else(|| {
            MeterSrvError::decode(format!(
                "no registers were read for block at {} (field '{}')",
                block.start, field.name
            ))
        })?;

        let value = decode_field(words, field)?;
        values.insert(
            field.name.clone(),
            FieldValue {
                value,
                unit: field.unit.clone(),
                description: field.description.clone(),
            },
        );
    }

    Ok(values)
}
