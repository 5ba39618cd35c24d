//! # dmacap: PipeWire screen capture tool
//!
//! Connects to a PipeWire video node (usually a screencast stream handed
//! out by the desktop portal), negotiates a raw RGB-family format, and
//! receives frames as read-only DMA-BUF mappings without copying them.
//!
//! The library half holds the TOML configuration and the default frame
//! sink; the capture machinery itself lives in `dmacap-core`.

pub mod config;
pub mod sink;
