//! Typed parameter snapshots crossing the sync boundary.
//!
//! A [`PropertyInfo`] carries one procedural or custom parameter. The value and
//! its bounds live together in [`PropertyValue`], so a payload can never
//! disagree with its type tag and strings can never carry a range.
//!
//! Hashing notes:
//! - floats hash via `to_bits`, arrays element by element;
//! - [`PropertyBatch::content_hash`] visits entries in sorted key order so the
//!   result does not depend on host iteration order.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::host::{Bounds, HostValue};

/// Where a parameter comes from on the host object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceType {
    /// Input of a node-based procedural modifier
    GeometryProcedural,
    /// User-attached parameter with UI metadata
    Custom,
}

/// Type tag of a [`PropertyValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyType {
    Int,
    Float,
    IntArray,
    FloatArray,
    String,
}

/// Value payload plus inclusive bounds for numeric kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PropertyValue {
    Int { value: i32, min: i32, max: i32 },
    Float { value: f32, min: f32, max: f32 },
    IntArray { values: Vec<i32>, min: i32, max: i32 },
    FloatArray { values: Vec<f32>, min: f32, max: f32 },
    String { value: String },
}

impl Hash for PropertyValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        use PropertyValue::*;
        std::mem::discriminant(self).hash(state);
        match self {
            Int { value, min, max } => (value, min, max).hash(state),
            Float { value, min, max } => {
                [value, min, max].iter().for_each(|f| f.to_bits().hash(state))
            }
            IntArray { values, min, max } => (values, min, max).hash(state),
            FloatArray { values, min, max } => {
                values.len().hash(state);
                values.iter().chain([min, max]).for_each(|f| f.to_bits().hash(state));
            }
            String { value } => value.hash(state),
        }
    }
}

fn int_bound(v: f64) -> i32 {
    // `as` saturates, NaN maps to 0
    v.round() as i32
}

fn float_bound(v: f64) -> f32 {
    v.clamp(f32::MIN as f64, f32::MAX as f64) as f32
}

impl PropertyValue {
    /// Convert a raw host value, copying the declared bounds for numeric kinds.
    ///
    /// Returns `None` for host kinds without a boundary representation, and
    /// for strings unless `allow_string` is set (procedural inputs never
    /// export strings). Missing bounds mean "full range of the type".
    pub fn from_host(value: &HostValue, bounds: Option<Bounds>, allow_string: bool) -> Option<Self> {
        let (imin, imax) = bounds.map_or((i32::MIN, i32::MAX), |b| (int_bound(b.min), int_bound(b.max)));
        let (fmin, fmax) = bounds.map_or((f32::MIN, f32::MAX), |b| (float_bound(b.min), float_bound(b.max)));

        let converted = match value {
            HostValue::Int(v) => PropertyValue::Int { value: *v, min: imin, max: imax },
            HostValue::Float(v) => PropertyValue::Float { value: *v, min: fmin, max: fmax },
            HostValue::IntArray(v) => PropertyValue::IntArray { values: v.clone(), min: imin, max: imax },
            HostValue::FloatArray(v) => PropertyValue::FloatArray { values: v.clone(), min: fmin, max: fmax },
            HostValue::String(s) if allow_string => PropertyValue::String { value: s.clone() },
            HostValue::String(_) | HostValue::Double(_) | HostValue::Bool(_) | HostValue::Group => return None,
        };
        Some(converted)
    }

    /// Value as the host stores it. Bounds are dropped: they only inform the consumer.
    pub fn to_host(&self) -> HostValue {
        match self {
            PropertyValue::Int { value, .. } => HostValue::Int(*value),
            PropertyValue::Float { value, .. } => HostValue::Float(*value),
            PropertyValue::IntArray { values, .. } => HostValue::IntArray(values.clone()),
            PropertyValue::FloatArray { values, .. } => HostValue::FloatArray(values.clone()),
            PropertyValue::String { value } => HostValue::String(value.clone()),
        }
    }

    pub fn property_type(&self) -> PropertyType {
        match self {
            PropertyValue::Int { .. } => PropertyType::Int,
            PropertyValue::Float { .. } => PropertyType::Float,
            PropertyValue::IntArray { .. } => PropertyType::IntArray,
            PropertyValue::FloatArray { .. } => PropertyType::FloatArray,
            PropertyValue::String { .. } => PropertyType::String,
        }
    }

    /// Element count for array kinds, `None` otherwise.
    pub fn len(&self) -> Option<usize> {
        match self {
            PropertyValue::IntArray { values, .. } => Some(values.len()),
            PropertyValue::FloatArray { values, .. } => Some(values.len()),
            _ => None,
        }
    }

    /// Bounds as `(min, max)` in double precision; `None` for strings.
    pub fn bounds(&self) -> Option<(f64, f64)> {
        match self {
            PropertyValue::Int { min, max, .. } | PropertyValue::IntArray { min, max, .. } => {
                Some((*min as f64, *max as f64))
            }
            PropertyValue::Float { min, max, .. } | PropertyValue::FloatArray { min, max, .. } => {
                Some((*min as f64, *max as f64))
            }
            PropertyValue::String { .. } => None,
        }
    }
}

/// One typed parameter snapshot.
#[derive(Debug, Clone, PartialEq, Hash, Serialize, Deserialize)]
pub struct PropertyInfo {
    /// Record path of the owning object
    pub path: String,
    /// Display name (socket name for procedural inputs)
    pub name: String,
    /// Owning modifier; empty for custom parameters
    #[serde(default)]
    pub modifier_name: String,
    /// Host-side identifier used to find the slot again on import
    pub property_name: String,
    pub source_type: SourceType,
    #[serde(flatten)]
    pub value: PropertyValue,
}

impl PropertyInfo {
    pub fn property_type(&self) -> PropertyType {
        self.value.property_type()
    }

    /// Sort key used for deterministic hashing.
    fn key(&self) -> (&str, SourceType, &str, &str) {
        (&self.path, self.source_type, &self.modifier_name, &self.property_name)
    }
}

/// Ordered collection of [`PropertyInfo`] produced by one export.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyBatch {
    entries: Vec<PropertyInfo>,
}

impl PropertyBatch {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn push(&mut self, info: PropertyInfo) {
        self.entries.push(info);
    }

    pub fn extend(&mut self, other: PropertyBatch) {
        self.entries.extend(other.entries);
    }

    pub fn iter(&self) -> impl Iterator<Item = &PropertyInfo> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_vec(self) -> Vec<PropertyInfo> {
        self.entries
    }

    /// Hash of every entry, visited in sorted key order.
    pub fn content_hash(&self) -> u64 {
        let mut sorted: Vec<&PropertyInfo> = self.entries.iter().collect();
        sorted.sort_by(|a, b| a.key().cmp(&b.key()));

        let mut hasher = DefaultHasher::new();
        sorted.len().hash(&mut hasher);
        for info in sorted {
            info.hash(&mut hasher);
        }
        hasher.finish()
    }
}

impl From<Vec<PropertyInfo>> for PropertyBatch {
    fn from(entries: Vec<PropertyInfo>) -> Self {
        Self { entries }
    }
}

impl IntoIterator for PropertyBatch {
    type Item = PropertyInfo;
    type IntoIter = std::vec::IntoIter<PropertyInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
