//! Reacting to the server's format choice.
//!
//! When the server fixes a format it emits a `param_changed` event with
//! a `Format` POD. [`ParamNegotiator`] parses it into a
//! [`NegotiatedFormat`], derives a [`BufferAllocationRequest`] and
//! submits it back through [`StreamControl::update_params`].

use bitflags::bitflags;
use tracing::{info, trace, warn};

use crate::error::{CaptureError, NegotiationError};
use crate::format::{Modifier, ValueRange, VideoFormat};
use crate::pod::{
    self, Choice, Fraction, Object, Rectangle, Value, buffers_key, format_key, object_type,
    param_id,
};
use crate::state::NegotiationPhase;
use crate::transport::StreamControl;

// ── NegotiatedFormat ─────────────────────────────────────────────

/// The concrete format the server selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub format: VideoFormat,
    pub size: Rectangle,
    pub framerate: Fraction,
    /// `None` when the server did not specify a modifier.
    pub modifier: Option<Modifier>,
}

impl NegotiatedFormat {
    /// Decode and parse a `Format` POD.
    pub fn from_pod(bytes: &[u8]) -> Result<Self, NegotiationError> {
        match pod::decode(bytes)? {
            Value::Object(obj) => Self::parse(&obj),
            _ => Err(NegotiationError::NotAnObject),
        }
    }

    /// Parse a decoded `Format` object.
    ///
    /// Format, size and framerate are mandatory; a choice collapses to its
    /// preferred value.
    pub fn parse(obj: &Object) -> Result<Self, NegotiationError> {
        if obj.object_type != object_type::FORMAT {
            return Err(NegotiationError::NotFormatObject {
                object_type: obj.object_type,
                id: obj.id,
            });
        }

        let media_type = optional(obj, format_key::MEDIA_TYPE, "mediaType", Value::as_id)?;
        let media_subtype =
            optional(obj, format_key::MEDIA_SUBTYPE, "mediaSubtype", Value::as_id)?;
        if media_type.is_some_and(|t| t != pod::MEDIA_TYPE_VIDEO)
            || media_subtype.is_some_and(|t| t != pod::MEDIA_SUBTYPE_RAW)
        {
            return Err(NegotiationError::NotRawVideo {
                media_type: media_type.unwrap_or(0),
                media_subtype: media_subtype.unwrap_or(0),
            });
        }

        let raw_format = required(obj, format_key::VIDEO_FORMAT, "format", Value::as_id)?;
        let format =
            VideoFormat::from_raw(raw_format).ok_or(NegotiationError::UnknownFormat(raw_format))?;

        let size = required(obj, format_key::VIDEO_SIZE, "size", Value::as_rectangle)?;
        if size.width == 0 || size.height == 0 {
            return Err(NegotiationError::ZeroSize {
                width: size.width,
                height: size.height,
            });
        }

        if packed_layout(format, size).is_none() {
            return Err(NegotiationError::FrameTooLarge {
                width: size.width,
                height: size.height,
            });
        }

        let framerate =
            required(obj, format_key::VIDEO_FRAMERATE, "framerate", Value::as_fraction)?;
        let modifier = optional(obj, format_key::VIDEO_MODIFIER, "modifier", Value::as_long)?
            .map(|m| Modifier(m as u64));

        Ok(Self {
            format,
            size,
            framerate,
            modifier,
        })
    }

    /// Tightly packed row length for this format.
    ///
    /// Saturates for sizes `parse` would have rejected.
    pub fn stride(&self) -> u32 {
        packed_layout(self.format, self.size).map_or(u32::MAX, |(stride, _)| stride)
    }

    /// Bytes of one tightly packed frame.
    pub fn frame_size(&self) -> u32 {
        packed_layout(self.format, self.size).map_or(u32::MAX, |(_, size)| size)
    }
}

/// Row and frame length of a tightly packed frame, when the frame length
/// fits the `Int` a `Buffers` param carries.
fn packed_layout(format: VideoFormat, size: Rectangle) -> Option<(u32, u32)> {
    let stride = size.width.checked_mul(format.bytes_per_pixel())?;
    let frame = stride.checked_mul(size.height)?;
    i32::try_from(frame).ok().map(|_| (stride, frame))
}

impl std::fmt::Display for NegotiatedFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} @ {}", self.format, self.size, self.framerate)?;
        match self.modifier {
            Some(m) => write!(f, " modifier {m}"),
            None => write!(f, " modifier unspecified"),
        }
    }
}

fn optional<T>(
    obj: &Object,
    key: u32,
    name: &'static str,
    read: fn(&Value) -> Option<T>,
) -> Result<Option<T>, NegotiationError> {
    obj.value(key)
        .map(|v| read(v).ok_or(NegotiationError::UnexpectedValue(name)))
        .transpose()
}

fn required<T>(
    obj: &Object,
    key: u32,
    name: &'static str,
    read: fn(&Value) -> Option<T>,
) -> Result<T, NegotiationError> {
    optional(obj, key, name, read)?.ok_or(NegotiationError::MissingProperty(name))
}

// ── BufferAllocationRequest ──────────────────────────────────────

bitflags! {
    /// Memory backings a buffer may use, as a mask of `1 << SPA_DATA_*`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DataTypes: u32 {
        const MEM_PTR = 1 << 1;
        const MEM_FD = 1 << 2;
        const DMA_BUF = 1 << 3;
        const MEM_ID = 1 << 4;
    }
}

/// Buffer constraints that do not depend on the negotiated format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPolicy {
    pub buffers: ValueRange<u32>,
    pub blocks: u32,
    pub data_types: DataTypes,
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            buffers: ValueRange::new(8, 8, 64),
            blocks: 1,
            data_types: DataTypes::DMA_BUF,
        }
    }
}

impl BufferPolicy {
    pub fn is_consistent(&self) -> bool {
        let b = &self.buffers;
        b.min >= 1 && b.min <= b.max && (b.min..=b.max).contains(&b.default) && self.blocks >= 1
            && !self.data_types.is_empty()
    }
}

/// The buffer pool we ask the server for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferAllocationRequest {
    pub buffers: ValueRange<u32>,
    pub blocks: u32,
    pub size: u32,
    pub stride: u32,
    pub data_types: DataTypes,
}

impl BufferAllocationRequest {
    /// Size the pool for `format`.
    pub fn for_format(format: &NegotiatedFormat, policy: &BufferPolicy) -> Self {
        Self {
            buffers: policy.buffers,
            blocks: policy.blocks,
            size: format.frame_size(),
            stride: format.stride(),
            data_types: policy.data_types,
        }
    }

    /// Build the `Buffers` param object.
    pub fn to_pod(&self) -> Object {
        let int = |v: u32| Value::Int(i32::try_from(v).unwrap_or(i32::MAX));
        Object::new(object_type::PARAM_BUFFERS, param_id::BUFFERS)
            .with(
                buffers_key::BUFFERS,
                Value::Choice(Choice::range(
                    int(self.buffers.default),
                    int(self.buffers.min),
                    int(self.buffers.max),
                )),
            )
            .with(buffers_key::BLOCKS, int(self.blocks))
            .with(buffers_key::SIZE, int(self.size))
            .with(buffers_key::STRIDE, int(self.stride))
            .with(
                buffers_key::DATA_TYPE,
                Value::Choice(Choice::flags(int(self.data_types.bits()))),
            )
    }
}

// ── ParamNegotiator ──────────────────────────────────────────────

/// What a `param_changed` event amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamOutcome {
    /// Not a format, or empty. Nothing changed.
    Ignored,
    /// The proposal could not be parsed; previous state kept.
    Malformed,
    /// A new format was stored and buffer parameters submitted.
    Submitted(BufferAllocationRequest),
}

/// Owns the negotiated format and the negotiation phase.
#[derive(Debug, Default)]
pub struct ParamNegotiator {
    policy: BufferPolicy,
    phase: NegotiationPhase,
    format: Option<NegotiatedFormat>,
}

impl ParamNegotiator {
    pub fn new(policy: BufferPolicy) -> Self {
        Self {
            policy,
            phase: NegotiationPhase::default(),
            format: None,
        }
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    /// The last successfully parsed format.
    pub fn format(&self) -> Option<&NegotiatedFormat> {
        self.format.as_ref()
    }

    /// Handle one `param_changed` event.
    ///
    /// Only a rejected submission is an error; it is fatal to the session.
    pub fn on_param_changed(
        &mut self,
        id: u32,
        param: Option<&[u8]>,
        control: &mut dyn StreamControl,
    ) -> Result<ParamOutcome, CaptureError> {
        let Some(bytes) = param.filter(|b| !b.is_empty()) else {
            trace!(id, "param cleared; ignoring");
            return Ok(ParamOutcome::Ignored);
        };
        if id != param_id::FORMAT {
            trace!(id, "non-format param changed; ignoring");
            return Ok(ParamOutcome::Ignored);
        }

        self.phase.propose()?;
        let format = match NegotiatedFormat::from_pod(bytes) {
            Ok(f) => f,
            Err(e) => {
                warn!("error parsing video format: {e}");
                self.phase.fail()?;
                return Ok(ParamOutcome::Malformed);
            }
        };
        info!("negotiated format: {format}");
        self.format = Some(format);

        let request = BufferAllocationRequest::for_format(&format, &self.policy);
        let pod = pod::encode(&Value::Object(request.to_pod()))?;
        if let Err(e) = control.update_params(&[pod]) {
            self.phase.fail()?;
            return Err(CaptureError::ParamsRejected(e.to_string()));
        }
        self.phase.submit()?;
        info!(
            size = request.size,
            stride = request.stride,
            buffers = request.buffers.default,
            "buffer parameters submitted"
        );
        Ok(ParamOutcome::Submitted(request))
    }

    /// Record that the server started delivering buffers.
    ///
    /// Returns `true` if this call moved the phase to `BuffersReady`.
    pub fn mark_buffers_ready(&mut self) -> bool {
        self.phase.buffers_ready().is_ok()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingControl {
        submitted: Vec<Vec<u8>>,
        reject: bool,
        stopped: bool,
    }

    impl StreamControl for RecordingControl {
        fn update_params(&mut self, params: &[Vec<u8>]) -> Result<(), CaptureError> {
            if self.reject {
                return Err(CaptureError::Transport("update refused".into()));
            }
            self.submitted.extend(params.iter().cloned());
            Ok(())
        }

        fn stop(&mut self) {
            self.stopped = true;
        }
    }

    fn format_pod(format: VideoFormat, width: u32, height: u32) -> Vec<u8> {
        let obj = Object::new(object_type::FORMAT, param_id::FORMAT)
            .with(format_key::MEDIA_TYPE, Value::Id(pod::MEDIA_TYPE_VIDEO))
            .with(format_key::MEDIA_SUBTYPE, Value::Id(pod::MEDIA_SUBTYPE_RAW))
            .with(format_key::VIDEO_FORMAT, Value::Id(format.as_raw()))
            .with(format_key::VIDEO_MODIFIER, Value::Long(0))
            .with(format_key::VIDEO_SIZE, Value::Rectangle(Rectangle::new(width, height)))
            .with(format_key::VIDEO_FRAMERATE, Value::Fraction(Fraction::new(60, 1)));
        pod::encode(&Value::Object(obj)).unwrap()
    }

    #[test]
    fn bgrx_720p_negotiates() {
        let mut negotiator = ParamNegotiator::default();
        let mut control = RecordingControl::default();
        let pod = format_pod(VideoFormat::Bgrx, 1280, 720);

        let outcome = negotiator
            .on_param_changed(param_id::FORMAT, Some(&pod), &mut control)
            .unwrap();

        let format = negotiator.format().unwrap();
        assert_eq!(format.format, VideoFormat::Bgrx);
        assert_eq!(format.size, Rectangle::new(1280, 720));
        assert_eq!(format.framerate, Fraction::new(60, 1));
        assert_eq!(format.modifier, Some(Modifier::LINEAR));

        let ParamOutcome::Submitted(request) = outcome else {
            panic!("expected a submission, got {outcome:?}");
        };
        assert_eq!(request.buffers, ValueRange::new(8, 8, 64));
        assert_eq!(request.blocks, 1);
        assert_eq!(request.data_types, DataTypes::DMA_BUF);
        assert_eq!(request.stride, 1280 * 4);
        assert_eq!(request.size, 1280 * 4 * 720);
        assert_eq!(negotiator.phase(), NegotiationPhase::ParamsSubmitted);

        assert_eq!(control.submitted.len(), 1);
        let submitted = pod::decode(&control.submitted[0]).unwrap();
        let obj = submitted.as_object().unwrap();
        assert_eq!(obj.object_type, object_type::PARAM_BUFFERS);
        assert_eq!(obj.value(buffers_key::BLOCKS), Some(&Value::Int(1)));
        let Some(Value::Choice(types)) = obj.value(buffers_key::DATA_TYPE) else {
            panic!("dataType is not a choice");
        };
        assert_eq!(types.values, vec![Value::Int(1 << 3)]);
    }

    #[test]
    fn unrelated_params_are_ignored() {
        let mut negotiator = ParamNegotiator::default();
        let mut control = RecordingControl::default();
        let pod = format_pod(VideoFormat::Bgrx, 1280, 720);

        assert_eq!(
            negotiator
                .on_param_changed(param_id::META, Some(&pod), &mut control)
                .unwrap(),
            ParamOutcome::Ignored
        );
        assert_eq!(
            negotiator
                .on_param_changed(param_id::FORMAT, None, &mut control)
                .unwrap(),
            ParamOutcome::Ignored
        );
        assert_eq!(
            negotiator
                .on_param_changed(param_id::FORMAT, Some(&[]), &mut control)
                .unwrap(),
            ParamOutcome::Ignored
        );
        assert!(control.submitted.is_empty());
        assert_eq!(negotiator.phase(), NegotiationPhase::AwaitingFormat);
    }

    #[test]
    fn malformed_proposal_keeps_previous_format() {
        let mut negotiator = ParamNegotiator::default();
        let mut control = RecordingControl::default();
        let good = format_pod(VideoFormat::Bgra, 800, 600);
        negotiator
            .on_param_changed(param_id::FORMAT, Some(&good), &mut control)
            .unwrap();
        let before = *negotiator.format().unwrap();

        let zero = format_pod(VideoFormat::Bgra, 0, 600);
        let outcome = negotiator
            .on_param_changed(param_id::FORMAT, Some(&zero), &mut control)
            .unwrap();
        assert_eq!(outcome, ParamOutcome::Malformed);
        assert_eq!(negotiator.format(), Some(&before));
        assert_eq!(negotiator.phase(), NegotiationPhase::NegotiationFailed);

        let outcome = negotiator
            .on_param_changed(param_id::FORMAT, Some(&[0xde, 0xad]), &mut control)
            .unwrap();
        assert_eq!(outcome, ParamOutcome::Malformed);
        assert_eq!(negotiator.format(), Some(&before));
        assert_eq!(control.submitted.len(), 1);
    }

    #[test]
    fn oversized_proposal_is_malformed() {
        let mut negotiator = ParamNegotiator::default();
        let mut control = RecordingControl::default();
        let good = format_pod(VideoFormat::Bgrx, 1280, 720);
        negotiator
            .on_param_changed(param_id::FORMAT, Some(&good), &mut control)
            .unwrap();
        let before = *negotiator.format().unwrap();

        // 40000x40000x4 wraps a u32; 23171x23171x4 fits a u32 but not an i32.
        for (width, height) in [(40_000, 40_000), (23_171, 23_171), (u32::MAX, 1)] {
            let pod = format_pod(VideoFormat::Bgrx, width, height);
            let outcome = negotiator
                .on_param_changed(param_id::FORMAT, Some(&pod), &mut control)
                .unwrap();
            assert_eq!(outcome, ParamOutcome::Malformed);
            assert_eq!(negotiator.format(), Some(&before));
        }
        assert_eq!(control.submitted.len(), 1);

        let err = NegotiatedFormat::from_pod(&format_pod(VideoFormat::Rgb, 40_000, 40_000))
            .unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::FrameTooLarge {
                width: 40_000,
                height: 40_000
            }
        ));
    }

    #[test]
    fn packed_layout_saturates_instead_of_wrapping() {
        let huge = NegotiatedFormat {
            format: VideoFormat::Bgrx,
            size: Rectangle::new(40_000, 40_000),
            framerate: Fraction::new(60, 1),
            modifier: None,
        };
        assert_eq!(huge.stride(), u32::MAX);
        assert_eq!(huge.frame_size(), u32::MAX);
    }

    #[test]
    fn rejected_submission_is_fatal() {
        let mut negotiator = ParamNegotiator::default();
        let mut control = RecordingControl {
            reject: true,
            ..Default::default()
        };
        let pod = format_pod(VideoFormat::Rgb, 640, 480);
        let err = negotiator
            .on_param_changed(param_id::FORMAT, Some(&pod), &mut control)
            .unwrap_err();
        assert!(matches!(err, CaptureError::ParamsRejected(_)));
        assert_eq!(negotiator.phase(), NegotiationPhase::NegotiationFailed);
    }

    #[test]
    fn parse_requires_mandatory_properties() {
        let obj = Object::new(object_type::FORMAT, param_id::FORMAT)
            .with(format_key::VIDEO_FORMAT, Value::Id(VideoFormat::Bgrx.as_raw()))
            .with(format_key::VIDEO_SIZE, Value::Rectangle(Rectangle::new(10, 10)));
        assert!(matches!(
            NegotiatedFormat::parse(&obj),
            Err(NegotiationError::MissingProperty("framerate"))
        ));
    }

    #[test]
    fn parse_rejects_wrong_media_and_format() {
        let audio = Object::new(object_type::FORMAT, param_id::FORMAT)
            .with(format_key::MEDIA_TYPE, Value::Id(1));
        assert!(matches!(
            NegotiatedFormat::parse(&audio),
            Err(NegotiationError::NotRawVideo { media_type: 1, .. })
        ));

        let nv12 = Object::new(object_type::FORMAT, param_id::FORMAT)
            .with(format_key::VIDEO_FORMAT, Value::Id(23))
            .with(format_key::VIDEO_SIZE, Value::Rectangle(Rectangle::new(10, 10)))
            .with(format_key::VIDEO_FRAMERATE, Value::Fraction(Fraction::new(30, 1)));
        assert!(matches!(
            NegotiatedFormat::parse(&nv12),
            Err(NegotiationError::UnknownFormat(23))
        ));

        let buffers = Object::new(object_type::PARAM_BUFFERS, param_id::BUFFERS);
        assert!(matches!(
            NegotiatedFormat::parse(&buffers),
            Err(NegotiationError::NotFormatObject { .. })
        ));

        let wrong_type = Object::new(object_type::FORMAT, param_id::FORMAT)
            .with(format_key::VIDEO_FORMAT, Value::Int(8));
        assert!(matches!(
            NegotiatedFormat::parse(&wrong_type),
            Err(NegotiationError::UnexpectedValue("format"))
        ));
    }

    #[test]
    fn unfixated_modifier_takes_preferred_value() {
        let obj = Object::new(object_type::FORMAT, param_id::FORMAT)
            .with(format_key::VIDEO_FORMAT, Value::Id(VideoFormat::Bgrx.as_raw()))
            .with(
                format_key::VIDEO_MODIFIER,
                Value::Choice(Choice::enumeration(
                    Value::Long(Modifier::NVIDIA_BLOCK_LINEAR_2D.0 as i64),
                    [Value::Long(0)],
                )),
            )
            .with(format_key::VIDEO_SIZE, Value::Rectangle(Rectangle::new(10, 10)))
            .with(format_key::VIDEO_FRAMERATE, Value::Fraction(Fraction::new(30, 1)));
        let parsed = NegotiatedFormat::parse(&obj).unwrap();
        assert_eq!(parsed.modifier, Some(Modifier::NVIDIA_BLOCK_LINEAR_2D));
    }

    #[test]
    fn display_reads_like_a_caps_line() {
        let f = NegotiatedFormat {
            format: VideoFormat::Bgrx,
            size: Rectangle::new(1280, 720),
            framerate: Fraction::new(60, 1),
            modifier: None,
        };
        assert_eq!(f.to_string(), "BGRx 1280x720 @ 60/1 modifier unspecified");
    }

    #[test]
    fn default_policy_is_consistent() {
        assert!(BufferPolicy::default().is_consistent());
        let bad = BufferPolicy {
            buffers: ValueRange::new(4, 8, 64),
            ..Default::default()
        };
        assert!(!bad.is_consistent());
    }
}
