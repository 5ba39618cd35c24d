//! Candidate formats offered to the server.
//!
//! A [`FormatCatalog`] turns a list of pixel formats and DRM modifiers
//! into one [`VideoFormatDescriptor`] per pixel format. All descriptors
//! are submitted together when the stream connects; the order expresses
//! preference but the server may pick any of them.

use std::str::FromStr;

use crate::error::CaptureError;
use crate::pod::{
    self, Choice, Fraction, Object, PropFlags, Rectangle, Value, format_key, object_type, param_id,
};

// ── VideoFormat ──────────────────────────────────────────────────

/// Packed RGB pixel layouts this consumer can read (`SPA_VIDEO_FORMAT_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoFormat {
    Rgbx,
    Bgrx,
    Xrgb,
    Xbgr,
    Rgba,
    Bgra,
    Argb,
    Abgr,
    Rgb,
    Bgr,
}

impl VideoFormat {
    pub const ALL: [VideoFormat; 10] = [
        Self::Rgbx,
        Self::Bgrx,
        Self::Xrgb,
        Self::Xbgr,
        Self::Rgba,
        Self::Bgra,
        Self::Argb,
        Self::Abgr,
        Self::Rgb,
        Self::Bgr,
    ];

    pub const fn as_raw(self) -> u32 {
        match self {
            Self::Rgbx => 7,
            Self::Bgrx => 8,
            Self::Xrgb => 9,
            Self::Xbgr => 10,
            Self::Rgba => 11,
            Self::Bgra => 12,
            Self::Argb => 13,
            Self::Abgr => 14,
            Self::Rgb => 15,
            Self::Bgr => 16,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_raw() == raw)
    }

    /// Bytes consumed by a single pixel.
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Rgb | Self::Bgr => 3,
            _ => 4,
        }
    }

    /// The name PipeWire uses for this format.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Rgbx => "RGBx",
            Self::Bgrx => "BGRx",
            Self::Xrgb => "xRGB",
            Self::Xbgr => "xBGR",
            Self::Rgba => "RGBA",
            Self::Bgra => "BGRA",
            Self::Argb => "ARGB",
            Self::Abgr => "ABGR",
            Self::Rgb => "RGB",
            Self::Bgr => "BGR",
        }
    }
}

impl std::fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for VideoFormat {
    type Err = CaptureError;

    /// Format names are matched case-sensitively, since `xRGB` and `XRGB`
    /// are conventionally different layouts.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.name() == s)
            .ok_or_else(|| CaptureError::Other(format!("unknown video format {s:?}")))
    }
}

// ── Modifier ─────────────────────────────────────────────────────

/// A DRM format modifier: the tiling/compression layout of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Modifier(pub u64);

impl Modifier {
    /// Plain row-major layout.
    pub const LINEAR: Modifier = Modifier(0);
    /// "No explicit modifier": the layout is implied by the driver.
    pub const INVALID: Modifier = Modifier(0x00ff_ffff_ffff_ffff);
    /// NVIDIA 16Bx2 block-linear layout, as exported by the proprietary driver.
    pub const NVIDIA_BLOCK_LINEAR_2D: Modifier = Modifier(0x0300_0000_0060_6011);

    /// The modifiers offered when none are configured.
    pub fn defaults() -> Vec<Modifier> {
        vec![
            Self::LINEAR,
            Self::LINEAR,
            Self::NVIDIA_BLOCK_LINEAR_2D,
            Self::INVALID,
        ]
    }
}

impl std::fmt::Display for Modifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::LINEAR => f.write_str("LINEAR"),
            Self::INVALID => f.write_str("INVALID"),
            Self(raw) => write!(f, "{raw:#018x}"),
        }
    }
}

impl FromStr for Modifier {
    type Err = CaptureError;

    /// Accepts `LINEAR`, `INVALID`, or a hexadecimal value with a `0x` prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LINEAR" => Ok(Self::LINEAR),
            "INVALID" => Ok(Self::INVALID),
            _ => s
                .strip_prefix("0x")
                .or_else(|| s.strip_prefix("0X"))
                .and_then(|hex| u64::from_str_radix(hex, 16).ok())
                .map(Self)
                .ok_or_else(|| CaptureError::Other(format!("unknown modifier {s:?}"))),
        }
    }
}

// ── ValueRange ───────────────────────────────────────────────────

/// A preferred value and the bounds it may be moved within.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueRange<T> {
    pub default: T,
    pub min: T,
    pub max: T,
}

impl<T> ValueRange<T> {
    pub const fn new(default: T, min: T, max: T) -> Self {
        Self { default, min, max }
    }
}

impl ValueRange<Rectangle> {
    pub fn is_consistent(&self) -> bool {
        self.min.within(&self.min, &self.max) && self.default.within(&self.min, &self.max)
    }

    fn to_choice(self) -> Choice {
        Choice::range(
            Value::Rectangle(self.default),
            Value::Rectangle(self.min),
            Value::Rectangle(self.max),
        )
    }
}

impl ValueRange<Fraction> {
    pub fn is_consistent(&self) -> bool {
        self.min.within(&self.min, &self.max) && self.default.within(&self.min, &self.max)
    }

    fn to_choice(self) -> Choice {
        Choice::range(
            Value::Fraction(self.default),
            Value::Fraction(self.min),
            Value::Fraction(self.max),
        )
    }
}

/// 1920x1080 within [1x1, 8192x4320].
pub const DEFAULT_SIZE: ValueRange<Rectangle> = ValueRange::new(
    Rectangle::new(1920, 1080),
    Rectangle::new(1, 1),
    Rectangle::new(8192, 4320),
);

/// 30/1 within [0/1, 360/1].
pub const DEFAULT_FRAMERATE: ValueRange<Fraction> = ValueRange::new(
    Fraction::new(30, 1),
    Fraction::new(0, 1),
    Fraction::new(360, 1),
);

// ── VideoFormatDescriptor ────────────────────────────────────────

/// One candidate format offered during negotiation.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFormatDescriptor {
    pub format: VideoFormat,
    /// Preferred modifier first, then every acceptable one.
    pub modifiers: Vec<Modifier>,
    pub size: ValueRange<Rectangle>,
    pub framerate: ValueRange<Fraction>,
}

impl VideoFormatDescriptor {
    /// Build the `EnumFormat` object announced for this candidate.
    pub fn to_pod(&self) -> Object {
        let mut obj = Object::new(object_type::FORMAT, param_id::ENUM_FORMAT)
            .with(format_key::MEDIA_TYPE, Value::Id(pod::MEDIA_TYPE_VIDEO))
            .with(format_key::MEDIA_SUBTYPE, Value::Id(pod::MEDIA_SUBTYPE_RAW))
            .with(format_key::VIDEO_FORMAT, Value::Id(self.format.as_raw()));

        if let Some(preferred) = self.modifiers.first() {
            // The first choice entry is the default; it is repeated in the
            // alternatives so the server sees the complete list.
            let choice = Choice::enumeration(
                Value::Long(preferred.0 as i64),
                self.modifiers.iter().map(|m| Value::Long(m.0 as i64)),
            );
            obj = obj.with_flags(
                format_key::VIDEO_MODIFIER,
                PropFlags::MANDATORY | PropFlags::DONT_FIXATE,
                Value::Choice(choice),
            );
        }

        obj.with(format_key::VIDEO_SIZE, Value::Choice(self.size.to_choice()))
            .with(
                format_key::VIDEO_FRAMERATE,
                Value::Choice(self.framerate.to_choice()),
            )
    }
}

// ── FormatCatalog ────────────────────────────────────────────────

/// The full candidate set offered in one negotiation round.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatCatalog {
    formats: Vec<VideoFormat>,
    modifiers: Vec<Modifier>,
    size: ValueRange<Rectangle>,
    framerate: ValueRange<Fraction>,
}

impl Default for FormatCatalog {
    fn default() -> Self {
        Self {
            formats: vec![
                VideoFormat::Rgb,
                VideoFormat::Bgrx,
                VideoFormat::Bgra,
                VideoFormat::Bgr,
                VideoFormat::Rgbx,
            ],
            modifiers: Modifier::defaults(),
            size: DEFAULT_SIZE,
            framerate: DEFAULT_FRAMERATE,
        }
    }
}

impl FormatCatalog {
    /// Build a catalog, rejecting inconsistent input.
    pub fn new(
        formats: Vec<VideoFormat>,
        modifiers: Vec<Modifier>,
        size: ValueRange<Rectangle>,
        framerate: ValueRange<Fraction>,
    ) -> Result<Self, CaptureError> {
        if formats.is_empty() {
            return Err(CaptureError::InvalidCatalog("no pixel formats"));
        }
        if !size.is_consistent() {
            return Err(CaptureError::InvalidCatalog(
                "default resolution outside its range",
            ));
        }
        if !framerate.is_consistent() {
            return Err(CaptureError::InvalidCatalog(
                "default framerate outside its range",
            ));
        }
        Ok(Self {
            formats,
            modifiers,
            size,
            framerate,
        })
    }

    pub fn formats(&self) -> &[VideoFormat] {
        &self.formats
    }

    pub fn modifiers(&self) -> &[Modifier] {
        &self.modifiers
    }

    /// One descriptor per pixel format, in preference order.
    pub fn descriptors(&self) -> Vec<VideoFormatDescriptor> {
        self.formats
            .iter()
            .map(|&format| VideoFormatDescriptor {
                format,
                modifiers: self.modifiers.clone(),
                size: self.size,
                framerate: self.framerate,
            })
            .collect()
    }

    /// Encode every descriptor as an `EnumFormat` POD.
    pub fn encode(&self) -> Result<Vec<Vec<u8>>, CaptureError> {
        self.descriptors()
            .iter()
            .map(|d| pod::encode(&Value::Object(d.to_pod())).map_err(CaptureError::from))
            .collect()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_order_and_shape() {
        let descriptors = FormatCatalog::default().descriptors();
        let formats: Vec<_> = descriptors.iter().map(|d| d.format).collect();
        assert_eq!(
            formats,
            vec![
                VideoFormat::Rgb,
                VideoFormat::Bgrx,
                VideoFormat::Bgra,
                VideoFormat::Bgr,
                VideoFormat::Rgbx,
            ]
        );
        for d in &descriptors {
            assert_eq!(d.modifiers, Modifier::defaults());
            assert_eq!(d.size.default, Rectangle::new(1920, 1080));
            assert_eq!(d.framerate.default, Fraction::new(30, 1));
        }
    }

    #[test]
    fn defaults_lie_within_their_ranges() {
        for d in FormatCatalog::default().descriptors() {
            assert!(d.size.default.within(&d.size.min, &d.size.max));
            assert!(d.framerate.default.within(&d.framerate.min, &d.framerate.max));
        }
    }

    #[test]
    fn inconsistent_ranges_are_rejected() {
        let size = ValueRange::new(
            Rectangle::new(9000, 1080),
            Rectangle::new(1, 1),
            Rectangle::new(8192, 4320),
        );
        let err = FormatCatalog::new(
            vec![VideoFormat::Bgrx],
            Modifier::defaults(),
            size,
            DEFAULT_FRAMERATE,
        )
        .unwrap_err();
        assert!(matches!(err, CaptureError::InvalidCatalog(_)));

        let err = FormatCatalog::new(vec![], vec![], DEFAULT_SIZE, DEFAULT_FRAMERATE).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidCatalog(_)));
    }

    #[test]
    fn modifier_choice_lists_preferred_first() {
        let d = &FormatCatalog::default().descriptors()[1];
        let obj = d.to_pod();
        assert_eq!(obj.object_type, object_type::FORMAT);
        assert_eq!(obj.id, param_id::ENUM_FORMAT);
        assert_eq!(
            obj.value(format_key::VIDEO_FORMAT),
            Some(&Value::Id(VideoFormat::Bgrx.as_raw()))
        );

        let prop = obj.property(format_key::VIDEO_MODIFIER).unwrap();
        assert_eq!(prop.flags, PropFlags::MANDATORY | PropFlags::DONT_FIXATE);
        let Value::Choice(choice) = &prop.value else {
            panic!("modifier is not a choice");
        };
        assert_eq!(choice.values.len(), 1 + Modifier::defaults().len());
        assert_eq!(choice.values[0], Value::Long(0));
        assert_eq!(
            choice.values.last(),
            Some(&Value::Long(Modifier::INVALID.0 as i64))
        );
    }

    #[test]
    fn no_modifiers_omits_the_property() {
        let catalog = FormatCatalog::new(
            vec![VideoFormat::Bgr],
            vec![],
            DEFAULT_SIZE,
            DEFAULT_FRAMERATE,
        )
        .unwrap();
        let obj = catalog.descriptors()[0].to_pod();
        assert!(obj.property(format_key::VIDEO_MODIFIER).is_none());
        assert!(obj.property(format_key::VIDEO_SIZE).is_some());
    }

    #[test]
    fn encoded_catalog_decodes_back() {
        let catalog = FormatCatalog::default();
        let pods = catalog.encode().unwrap();
        assert_eq!(pods.len(), 5);
        let decoded = pod::decode(&pods[0]).unwrap();
        assert_eq!(decoded, Value::Object(catalog.descriptors()[0].to_pod()));
    }

    #[test]
    fn format_names_parse() {
        assert_eq!("BGRx".parse::<VideoFormat>().unwrap(), VideoFormat::Bgrx);
        assert_eq!("xRGB".parse::<VideoFormat>().unwrap(), VideoFormat::Xrgb);
        assert!("NV12".parse::<VideoFormat>().is_err());
        assert_eq!(VideoFormat::from_raw(15), Some(VideoFormat::Rgb));
        assert_eq!(VideoFormat::from_raw(0), None);
        assert_eq!(VideoFormat::Bgr.bytes_per_pixel(), 3);
    }

    #[test]
    fn modifier_display() {
        assert_eq!(Modifier::LINEAR.to_string(), "LINEAR");
        assert_eq!(Modifier::INVALID.to_string(), "INVALID");
        assert_eq!(
            Modifier::NVIDIA_BLOCK_LINEAR_2D.to_string(),
            "0x0300000000606011"
        );
    }

    #[test]
    fn modifier_parses_its_own_display() {
        for m in Modifier::defaults() {
            assert_eq!(m.to_string().parse::<Modifier>().unwrap(), m);
        }
        assert_eq!("0x1".parse::<Modifier>().unwrap(), Modifier(1));
        assert!("linear".parse::<Modifier>().is_err());
        assert!("0xzz".parse::<Modifier>().is_err());
    }
}
