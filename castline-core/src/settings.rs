//! Settings snapshot handed to the core by the settings collaborator.
//!
//! [`Settings`] is a plain value: the core never mutates the caller's
//! copy. The quality controller returns adjusted copies instead.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StreamError;

// ── Limits ───────────────────────────────────────────────────────

/// Smallest accepted frame width.
pub const MIN_WIDTH: u32 = 160;
/// Smallest accepted frame height.
pub const MIN_HEIGHT: u32 = 120;
/// Largest accepted frame width.
pub const MAX_WIDTH: u32 = 3840;
/// Largest accepted frame height.
pub const MAX_HEIGHT: u32 = 2160;
/// Encoder macroblock grid.
pub const ALIGNMENT: u32 = 16;

const DEFAULT_RTMP_PORT: u16 = 1935;
const DEFAULT_RTMPS_PORT: u16 = 443;

// ── Settings ─────────────────────────────────────────────────────

/// Immutable stream configuration snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Ingest URL, e.g. `rtmp://live.example.com/app`.
    pub rtmp_url: String,
    /// Publish credential. Sanitized before use.
    pub stream_key: String,
    /// Declared stream width in pixels.
    pub video_width: u32,
    /// Declared stream height in pixels.
    pub video_height: u32,
    /// Video bitrate in kbit/s.
    pub video_bitrate_kbps: u32,
    /// Audio bitrate in kbit/s (carried, not used by the video path).
    pub audio_bitrate_kbps: u32,
    /// Frames per second.
    pub frame_rate: u32,
    /// Reconnect automatically after network failures.
    pub auto_reconnect: bool,
    /// Frame queue depth between capture and the frame thread.
    pub buffer_size: usize,
    /// Connect timeout in seconds.
    pub connection_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rtmp_url: String::new(),
            stream_key: String::new(),
            video_width: 1280,
            video_height: 720,
            video_bitrate_kbps: 2500,
            audio_bitrate_kbps: 128,
            frame_rate: 30,
            auto_reconnect: true,
            buffer_size: 8,
            connection_timeout_secs: 8,
        }
    }
}

impl Settings {
    /// Check every field and parse the ingest URL.
    ///
    /// Fails with a configuration-class [`StreamError`]; nothing here is
    /// worth retrying.
    pub fn validate(&self) -> Result<IngestUrl, StreamError> {
        let url: IngestUrl = self.rtmp_url.parse()?;

        if self.sanitized_stream_key().is_empty() {
            return Err(StreamError::MissingStreamKey);
        }
        if self.video_width == 0 || self.video_height == 0 {
            return Err(StreamError::InvalidSettings(format!(
                "resolution {}x{} is empty",
                self.video_width, self.video_height
            )));
        }
        if self.video_width > MAX_WIDTH || self.video_height > MAX_HEIGHT {
            return Err(StreamError::InvalidSettings(format!(
                "resolution {}x{} exceeds {MAX_WIDTH}x{MAX_HEIGHT}",
                self.video_width, self.video_height
            )));
        }
        if !(1..=120).contains(&self.frame_rate) {
            return Err(StreamError::InvalidSettings(format!(
                "frame rate {} outside 1..=120",
                self.frame_rate
            )));
        }
        if self.video_bitrate_kbps == 0 {
            return Err(StreamError::InvalidSettings("video bitrate is zero".into()));
        }

        Ok(url)
    }

    /// The stream key with whitespace, control and zero-width characters removed.
    pub fn sanitized_stream_key(&self) -> String {
        sanitize_stream_key(&self.stream_key)
    }

    /// Target sample dimensions: rounded up to the 16-pixel grid and
    /// clamped to the supported range.
    pub fn target_dimensions(&self) -> (u32, u32) {
        (
            align_dimension(self.video_width, MIN_WIDTH, MAX_WIDTH),
            align_dimension(self.video_height, MIN_HEIGHT, MAX_HEIGHT),
        )
    }

    /// Duration of one frame at the configured rate.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.frame_rate.max(1)))
    }

    /// Connect timeout as a `Duration`.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs.max(1))
    }

    /// Whether re-applying `other` requires reconfiguring the encoder.
    ///
    /// Only dimensions, bitrate and frame rate are material.
    pub fn materially_differs(&self, other: &Settings) -> bool {
        self.video_width != other.video_width
            || self.video_height != other.video_height
            || self.video_bitrate_kbps != other.video_bitrate_kbps
            || self.frame_rate != other.frame_rate
    }
}

/// Strip whitespace, control characters and zero-width characters.
///
/// Keys pasted from web dashboards routinely carry a trailing newline or
/// an invisible U+200B; either makes the ingest server reject the key.
pub fn sanitize_stream_key(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && !c.is_control() && !is_zero_width(*c))
        .collect()
}

fn is_zero_width(c: char) -> bool {
    matches!(c, '\u{200B}'..='\u{200D}' | '\u{2060}' | '\u{FEFF}')
}

/// Round `value` up to the next multiple of [`ALIGNMENT`] inside `[min, max]`.
///
/// `min` itself is aligned upwards, so a floor of 120 yields 128.
pub fn align_dimension(value: u32, min: u32, max: u32) -> u32 {
    let clamped = value.clamp(min, max);
    let aligned = clamped.div_ceil(ALIGNMENT) * ALIGNMENT;
    if aligned > max {
        max / ALIGNMENT * ALIGNMENT
    } else {
        aligned
    }
}

// ── IngestUrl ────────────────────────────────────────────────────

/// URL scheme of the ingest endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Rtmp,
    Rtmps,
}

/// A parsed `rtmp://host[:port]/app` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestUrl {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Application path without leading or trailing slashes.
    pub app: String,
}

impl IngestUrl {
    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for IngestUrl {
    type Err = StreamError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(StreamError::InvalidUrl("url is empty".into()));
        }

        let (scheme_str, rest) = trimmed
            .split_once("://")
            .ok_or_else(|| StreamError::InvalidUrl(format!("{trimmed}: missing scheme")))?;

        let (scheme, default_port) = match scheme_str.to_ascii_lowercase().as_str() {
            "rtmp" => (Scheme::Rtmp, DEFAULT_RTMP_PORT),
            "rtmps" => (Scheme::Rtmps, DEFAULT_RTMPS_PORT),
            other => {
                return Err(StreamError::InvalidUrl(format!(
                    "{trimmed}: scheme `{other}` is not rtmp"
                )));
            }
        };

        let (authority, app) = match rest.split_once('/') {
            Some((authority, app)) => (authority, app.trim_matches('/')),
            None => (rest, ""),
        };

        let (host, port) = split_host_port(authority, default_port)
            .ok_or_else(|| StreamError::InvalidUrl(format!("{trimmed}: bad host or port")))?;
        if host.is_empty() {
            return Err(StreamError::InvalidUrl(format!("{trimmed}: missing host")));
        }

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            app: app.to_string(),
        })
    }
}

fn split_host_port(authority: &str, default_port: u16) -> Option<(&str, u16)> {
    // [v6]:port
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        return match tail.strip_prefix(':') {
            Some(port) => Some((host, port.parse().ok()?)),
            None if tail.is_empty() => Some((host, default_port)),
            None => None,
        };
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host, port.parse().ok()?)),
        None => Some((authority, default_port)),
    }
}

impl fmt::Display for IngestUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Rtmp => "rtmp",
            Scheme::Rtmps => "rtmps",
        };
        write!(f, "{scheme}://{}/{}", self.socket_addr(), self.app)
    }
}

// ── Tests ────────────────────────────────────────────────────────
