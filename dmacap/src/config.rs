//! Configuration for the capture tool.

use std::path::Path;
use std::time::Duration;

use dmacap_core::{
    BufferPolicy, CaptureError, DataTypes, FormatCatalog, Fraction, Modifier, PipeWireOptions,
    Rectangle, SessionConfig, StreamFlags, ValueRange, VideoFormat,
};
use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Which node to capture and how to connect.
    pub stream: StreamConfig,
    /// Formats offered to the server.
    pub catalog: CatalogConfig,
    /// Buffer pool constraints.
    pub buffers: BuffersConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Stream connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// PipeWire node id to capture. Unset lets the server pick.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<u32>,
    /// Stream name shown in the graph.
    pub name: String,
    /// `media.role` stream property.
    pub media_role: String,
    /// Link to the node automatically.
    pub autoconnect: bool,
    /// Ask PipeWire to map buffers on our behalf where possible.
    pub map_buffers: bool,
    /// Seconds to wait for the stream to start; 0 waits forever.
    pub startup_timeout_secs: u64,
}

/// Candidate formats and ranges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Pixel formats in preference order, by PipeWire name ("BGRx", "RGB").
    pub formats: Vec<String>,
    /// DRM modifiers: "LINEAR", "INVALID" or hex ("0x0300000000606011").
    /// The first is preferred.
    pub modifiers: Vec<String>,
    /// `[width, height]`
    pub default_size: [u32; 2],
    pub min_size: [u32; 2],
    pub max_size: [u32; 2],
    /// `[numerator, denominator]`
    pub default_framerate: [u32; 2],
    pub min_framerate: [u32; 2],
    pub max_framerate: [u32; 2],
}

/// Buffer pool constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuffersConfig {
    pub count: u32,
    pub min_count: u32,
    pub max_count: u32,
    /// Data blocks per buffer.
    pub blocks: u32,
    /// Acceptable backings: "dmabuf", "memfd", "memptr".
    pub data_types: Vec<String>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    /// `RUST_LOG` takes precedence.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for StreamConfig {
    fn default() -> Self {
        let pw = PipeWireOptions::default();
        Self {
            node_id: None,
            name: pw.name,
            media_role: pw.media_role,
            autoconnect: true,
            map_buffers: true,
            startup_timeout_secs: 0,
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        let catalog = FormatCatalog::default();
        let size = dmacap_core::format::DEFAULT_SIZE;
        let rate = dmacap_core::format::DEFAULT_FRAMERATE;
        Self {
            formats: catalog.formats().iter().map(ToString::to_string).collect(),
            modifiers: catalog.modifiers().iter().map(ToString::to_string).collect(),
            default_size: [size.default.width, size.default.height],
            min_size: [size.min.width, size.min.height],
            max_size: [size.max.width, size.max.height],
            default_framerate: [rate.default.num, rate.default.denom],
            min_framerate: [rate.min.num, rate.min.denom],
            max_framerate: [rate.max.num, rate.max.denom],
        }
    }
}

impl Default for BuffersConfig {
    fn default() -> Self {
        let policy = BufferPolicy::default();
        Self {
            count: policy.buffers.default,
            min_count: policy.buffers.min,
            max_count: policy.buffers.max,
            blocks: policy.blocks,
            data_types: vec!["dmabuf".into()],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl CaptureConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Connection options for the PipeWire backend.
    pub fn to_pipewire_options(&self, remote_fd: Option<i32>) -> PipeWireOptions {
        PipeWireOptions {
            name: self.stream.name.clone(),
            media_role: self.stream.media_role.clone(),
            remote_fd,
        }
    }

    /// Validate and convert into a `SessionConfig`.
    pub fn to_session_config(&self) -> Result<SessionConfig, CaptureError> {
        let formats = self
            .catalog
            .formats
            .iter()
            .map(|s| s.parse::<VideoFormat>())
            .collect::<Result<Vec<_>, _>>()?;
        let modifiers = self
            .catalog
            .modifiers
            .iter()
            .map(|s| s.parse::<Modifier>())
            .collect::<Result<Vec<_>, _>>()?;

        let rect = |[w, h]: [u32; 2]| Rectangle::new(w, h);
        let frac = |[n, d]: [u32; 2]| Fraction::new(n, d);
        let c = &self.catalog;
        let catalog = FormatCatalog::new(
            formats,
            modifiers,
            ValueRange::new(rect(c.default_size), rect(c.min_size), rect(c.max_size)),
            ValueRange::new(
                frac(c.default_framerate),
                frac(c.min_framerate),
                frac(c.max_framerate),
            ),
        )?;

        let mut data_types = DataTypes::empty();
        for name in &self.buffers.data_types {
            data_types |= match name.to_ascii_lowercase().as_str() {
                "dmabuf" => DataTypes::DMA_BUF,
                "memfd" => DataTypes::MEM_FD,
                "memptr" => DataTypes::MEM_PTR,
                other => {
                    return Err(CaptureError::Other(format!(
                        "unknown buffer data type {other:?}"
                    )));
                }
            };
        }
        let buffers = BufferPolicy {
            buffers: ValueRange::new(
                self.buffers.count,
                self.buffers.min_count,
                self.buffers.max_count,
            ),
            blocks: self.buffers.blocks,
            data_types,
        };
        if !buffers.is_consistent() {
            return Err(CaptureError::InvalidCatalog("inconsistent buffer policy"));
        }

        let mut flags = StreamFlags::empty();
        flags.set(StreamFlags::AUTOCONNECT, self.stream.autoconnect);
        flags.set(StreamFlags::MAP_BUFFERS, self.stream.map_buffers);

        Ok(SessionConfig {
            target: self.stream.node_id,
            flags,
            catalog,
            buffers,
            startup_timeout: (self.stream.startup_timeout_secs > 0)
                .then(|| Duration::from_secs(self.stream.startup_timeout_secs)),
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────
