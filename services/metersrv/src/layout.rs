//! Device and register layout descriptors
//!
//! A [`FieldLayout`] is the declarative table that replaces per-register
//! decode code: an ordered list of register blocks (gaps between them are never
//! read) plus the named fields decoded out of those blocks. Layouts are checked
//! once at construction, so a layout that exists is always decodable.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{MeterSrvError, Result};

/// Default fixed-point divisor for 32-bit scaled fields (2^16)
pub const DEFAULT_SCALE: f64 = 65536.0;

/// Network identity of one field device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEndpoint {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
}

impl DeviceEndpoint {
    /// `host:port` string used for connecting and logging
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Contiguous run of holding registers read together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterBlock {
    pub start: u16,
    pub count: u16,
}

impl RegisterBlock {
    pub fn new(start: u16, count: u16) -> Self {
        Self { start, count }
    }

    /// One past the last address, widened so `start + count` cannot overflow
    pub fn end(&self) -> u32 {
        u32::from(self.start) + u32::from(self.count)
    }
}

/// How a field's words turn into an engineering value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeKind {
    /// Single unsigned 16-bit word, no scaling
    Raw,
    /// High/low word pair as u32, divided by the scale
    Unsigned32,
    /// High/low word pair as two's-complement i32, divided by the scale
    Signed32,
}

impl DecodeKind {
    /// Number of consecutive registers the field consumes
    pub fn word_width(self) -> u16 {
        match self {
            DecodeKind::Raw => 1,
            DecodeKind::Unsigned32 | DecodeKind::Signed32 => 2,
        }
    }
}

/// One named quantity inside a register block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    /// Index into [`FieldLayout::blocks`]
    pub block: usize,
    /// Word offset from the block start
    pub offset: u16,
    pub kind: DecodeKind,
    #[serde(default)]
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Overrides [`DEFAULT_SCALE`] for 32-bit kinds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, block: usize, offset: u16, kind: DecodeKind) -> Self {
        Self {
            name: name.into(),
            block,
            offset,
            kind,
            unit: String::new(),
            description: None,
            scale: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    /// Divisor applied to 32-bit kinds
    pub fn effective_scale(&self) -> f64 {
        self.scale.unwrap_or(DEFAULT_SCALE)
    }
}

/// Validated register blocks plus the fields decoded from them
#[derive(Debug, Clone, PartialEq)]
pub struct FieldLayout {
    blocks: Vec<RegisterBlock>,
    fields: Vec<FieldDescriptor>,
}

impl FieldLayout {
    /// Build a layout, rejecting anything the decoder could trip over.
    ///
    /// Fails with [`MeterSrvError::DecodeError`] when blocks overlap, a block is
    /// empty or runs past address 65535, a field points at a missing block or
    /// past the end of its block, a scale is not a positive finite number, or
    /// two fields share a name.
    pub fn new(blocks: Vec<RegisterBlock>, fields: Vec<FieldDescriptor>) -> Result<Self> {
        if blocks.is_empty() {
            return Err(MeterSrvError::decode("layout declares no register blocks"));
        }

        for block in &blocks {
            if block.count == 0 {
                return Err(MeterSrvError::decode(format!(
                    "block at {} has zero registers",
                    block.start
                )));
            }
            if block.end() > 0x1_0000 {
                return Err(MeterSrvError::decode(format!(
                    "block at {} with {} registers runs past address 65535",
                    block.start, block.count
                )));
            }
        }

        let mut sorted: Vec<&RegisterBlock> = blocks.iter().collect();
        sorted.sort_by_key(|b| b.start);
        for pair in sorted.windows(2) {
            if pair[0].end() > u32::from(pair[1].start) {
                return Err(MeterSrvError::decode(format!(
                    "blocks {}+{} and {}+{} overlap",
                    pair[0].start, pair[0].count, pair[1].start, pair[1].count
                )));
            }
        }

        let mut names = HashSet::with_capacity(fields.len());
        for field in &fields {
            let block = blocks.get(field.block).ok_or_else(|| {
                MeterSrvError::decode(format!(
                    "field '{}' references block {} but only {} blocks exist",
                    field.name,
                    field.block,
                    blocks.len()
                ))
            })?;

            let end = u32::from(field.offset) + u32::from(field.kind.word_width());
            if end > u32::from(block.count) {
                return Err(MeterSrvError::decode(format!(
                    "field '{}' needs words {}..{} but block at {} holds {}",
                    field.name, field.offset, end, block.start, block.count
                )));
            }

            if let Some(scale) = field.scale {
                if !scale.is_finite() || scale <= 0.0 {
                    return Err(MeterSrvError::decode(format!(
                        "field '{}' has invalid scale {}",
                        field.name, scale
                    )));
                }
            }

            if !names.insert(field.name.as_str()) {
                return Err(MeterSrvError::decode(format!(
                    "duplicate field name '{}'",
                    field.name
                )));
            }
        }

        Ok(Self { blocks, fields })
    }

    pub fn blocks(&self) -> &[RegisterBlock] {
        &self.blocks
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Total registers read per cycle
    pub fn register_count(&self) -> usize {
        self.blocks.iter().map(|b| usize::from(b.count)).sum()
    }
}
