//! SPA POD values: the parameter language spoken during negotiation.
//!
//! PipeWire describes formats and buffer requirements as self-describing
//! binary trees ("plain old data"). Only the subset needed for raw video
//! negotiation is modelled here; any other pod type found while decoding
//! is preserved as [`Value::Opaque`] so unrelated properties in a server
//! proposal never break parsing.
//!
//! ## Wire format
//!
//! Every pod is an 8-byte header followed by its body, padded to 8 bytes:
//!
//! ```text
//! size:   u32  (body length, without padding)
//! type:   u32  (pod_type::*)
//! body:   [u8; size]
//! pad:    [u8; 0..8]
//! ```
//!
//! Objects carry `{object_type, id}` and then properties
//! `{key, flags, pod}`. Choices carry `{kind, flags}` and a child header
//! `{child_size, child_type}` followed by packed child bodies.

mod codec;

use bitflags::bitflags;

pub use codec::{decode, encode};

// ── Constants ────────────────────────────────────────────────────

/// Pod type tags.
pub mod pod_type {
    pub const NONE: u32 = 1;
    pub const BOOL: u32 = 2;
    pub const ID: u32 = 3;
    pub const INT: u32 = 4;
    pub const LONG: u32 = 5;
    pub const RECTANGLE: u32 = 10;
    pub const FRACTION: u32 = 11;
    pub const OBJECT: u32 = 15;
    pub const CHOICE: u32 = 19;
}

/// Object type tags (`SPA_TYPE_OBJECT_*`).
pub mod object_type {
    pub const FORMAT: u32 = 0x40003;
    pub const PARAM_BUFFERS: u32 = 0x40004;
}

/// Parameter ids (`SPA_PARAM_*`).
pub mod param_id {
    pub const ENUM_FORMAT: u32 = 3;
    pub const FORMAT: u32 = 4;
    pub const BUFFERS: u32 = 5;
    pub const META: u32 = 6;
}

/// Keys of `Format` objects (`SPA_FORMAT_*`).
pub mod format_key {
    pub const MEDIA_TYPE: u32 = 1;
    pub const MEDIA_SUBTYPE: u32 = 2;
    pub const VIDEO_FORMAT: u32 = 0x20001;
    pub const VIDEO_MODIFIER: u32 = 0x20002;
    pub const VIDEO_SIZE: u32 = 0x20003;
    pub const VIDEO_FRAMERATE: u32 = 0x20004;
}

/// Keys of `ParamBuffers` objects (`SPA_PARAM_BUFFERS_*`).
pub mod buffers_key {
    pub const BUFFERS: u32 = 1;
    pub const BLOCKS: u32 = 2;
    pub const SIZE: u32 = 3;
    pub const STRIDE: u32 = 4;
    pub const DATA_TYPE: u32 = 6;
}

/// `SPA_MEDIA_TYPE_video`.
pub const MEDIA_TYPE_VIDEO: u32 = 2;
/// `SPA_MEDIA_SUBTYPE_raw`.
pub const MEDIA_SUBTYPE_RAW: u32 = 1;

bitflags! {
    /// Per-property flags (`SPA_POD_PROP_FLAG_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PropFlags: u32 {
        const READONLY = 1 << 0;
        const HARDWARE = 1 << 1;
        const HINT_DICT = 1 << 2;
        const MANDATORY = 1 << 3;
        const DONT_FIXATE = 1 << 4;
    }
}

// ── Scalars ──────────────────────────────────────────────────────

/// A width × height pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rectangle {
    pub width: u32,
    pub height: u32,
}

impl Rectangle {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether both dimensions lie within `[min, max]`.
    pub fn within(&self, min: &Self, max: &Self) -> bool {
        (min.width..=max.width).contains(&self.width)
            && (min.height..=max.height).contains(&self.height)
    }
}

impl std::fmt::Display for Rectangle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A rational number, used for framerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fraction {
    pub num: u32,
    pub denom: u32,
}

impl Fraction {
    pub const fn new(num: u32, denom: u32) -> Self {
        Self { num, denom }
    }

    /// Compare two fractions by value. `None` when either denominator is 0.
    pub fn cmp_value(&self, other: &Self) -> Option<std::cmp::Ordering> {
        if self.denom == 0 || other.denom == 0 {
            return None;
        }
        let lhs = u64::from(self.num) * u64::from(other.denom);
        let rhs = u64::from(other.num) * u64::from(self.denom);
        Some(lhs.cmp(&rhs))
    }

    /// Whether the value lies within `[min, max]`.
    pub fn within(&self, min: &Self, max: &Self) -> bool {
        use std::cmp::Ordering::*;
        matches!(self.cmp_value(min), Some(Greater | Equal))
            && matches!(self.cmp_value(max), Some(Less | Equal))
    }
}

impl std::fmt::Display for Fraction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.denom)
    }
}

// ── Choice ───────────────────────────────────────────────────────

/// How the values of a [`Choice`] are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChoiceKind {
    /// A single value.
    None,
    /// `[default, min, max]`.
    Range,
    /// `[default, min, max, step]`.
    Step,
    /// `[default, alternatives...]`.
    Enum,
    /// `[flags]`: a bit mask of acceptable values.
    Flags,
}

impl ChoiceKind {
    pub const fn as_raw(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Range => 1,
            Self::Step => 2,
            Self::Enum => 3,
            Self::Flags => 4,
        }
    }

    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Range),
            2 => Some(Self::Step),
            3 => Some(Self::Enum),
            4 => Some(Self::Flags),
            _ => None,
        }
    }
}

/// A set of acceptable values of one scalar type.
///
/// The first value is always the preferred (default) one.
#[derive(Debug, Clone, PartialEq)]
pub struct Choice {
    pub kind: ChoiceKind,
    pub flags: u32,
    pub values: Vec<Value>,
}

impl Choice {
    /// `default` within `[min, max]`.
    pub fn range(default: Value, min: Value, max: Value) -> Self {
        Self {
            kind: ChoiceKind::Range,
            flags: 0,
            values: vec![default, min, max],
        }
    }

    /// `preferred` followed by every acceptable alternative.
    pub fn enumeration(preferred: Value, alternatives: impl IntoIterator<Item = Value>) -> Self {
        let mut values = vec![preferred];
        values.extend(alternatives);
        Self {
            kind: ChoiceKind::Enum,
            flags: 0,
            values,
        }
    }

    /// A single bit mask.
    pub fn flags(mask: Value) -> Self {
        Self {
            kind: ChoiceKind::Flags,
            flags: 0,
            values: vec![mask],
        }
    }

    /// The preferred value.
    pub fn default_value(&self) -> Option<&Value> {
        self.values.first()
    }
}

// ── Object ───────────────────────────────────────────────────────

/// One keyed entry of an [`Object`].
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub key: u32,
    pub flags: PropFlags,
    pub value: Value,
}

/// A typed collection of properties, e.g. a `Format` or `ParamBuffers`.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub object_type: u32,
    pub id: u32,
    pub properties: Vec<Property>,
}

impl Object {
    pub fn new(object_type: u32, id: u32) -> Self {
        Self {
            object_type,
            id,
            properties: Vec::new(),
        }
    }

    /// Append a property with no flags.
    pub fn with(self, key: u32, value: Value) -> Self {
        self.with_flags(key, PropFlags::empty(), value)
    }

    /// Append a property with explicit flags.
    pub fn with_flags(mut self, key: u32, flags: PropFlags, value: Value) -> Self {
        self.properties.push(Property { key, flags, value });
        self
    }

    pub fn property(&self, key: u32) -> Option<&Property> {
        self.properties.iter().find(|p| p.key == key)
    }

    pub fn value(&self, key: u32) -> Option<&Value> {
        self.property(key).map(|p| &p.value)
    }
}

// ── Value ────────────────────────────────────────────────────────

/// A decoded pod.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Id(u32),
    Int(i32),
    Long(i64),
    Rectangle(Rectangle),
    Fraction(Fraction),
    Choice(Choice),
    Object(Object),
    /// Any pod type this crate does not interpret, kept verbatim.
    Opaque { pod_type: u32, body: Vec<u8> },
}

impl Value {
    /// The pod type tag this value encodes to.
    pub fn pod_type(&self) -> u32 {
        match self {
            Self::None => pod_type::NONE,
            Self::Bool(_) => pod_type::BOOL,
            Self::Id(_) => pod_type::ID,
            Self::Int(_) => pod_type::INT,
            Self::Long(_) => pod_type::LONG,
            Self::Rectangle(_) => pod_type::RECTANGLE,
            Self::Fraction(_) => pod_type::FRACTION,
            Self::Choice(_) => pod_type::CHOICE,
            Self::Object(_) => pod_type::OBJECT,
            Self::Opaque { pod_type, .. } => *pod_type,
        }
    }

    /// The value a consumer should act on: a choice collapses to its
    /// preferred value, anything else is returned unchanged.
    pub fn fixated(&self) -> &Value {
        match self {
            Self::Choice(choice) => choice.default_value().unwrap_or(self),
            other => other,
        }
    }

    pub fn as_id(&self) -> Option<u32> {
        match self.fixated() {
            Self::Id(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self.fixated() {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self.fixated() {
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_rectangle(&self) -> Option<Rectangle> {
        match self.fixated() {
            Self::Rectangle(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_fraction(&self) -> Option<Fraction> {
        match self.fixated() {
            Self::Fraction(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }
}

impl From<Object> for Value {
    fn from(o: Object) -> Self {
        Value::Object(o)
    }
}

impl From<Choice> for Value {
    fn from(c: Choice) -> Self {
        Value::Choice(c)
    }
}
