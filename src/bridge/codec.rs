//! Value codec: model values to MQTT payloads and back.
//!
//! Encoding never fails. Anything the codec has no dedicated rule for is sent
//! as its generic string form.

use crate::model::{ImageData, Value};
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write as _};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Wire form of an encoded value.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// No value. Empty on plain topics, `null` inside a JSON envelope.
    Absent,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl Payload {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Payload::Absent => Vec::new(),
            Payload::Text(text) => text.into_bytes(),
            Payload::Int(i) => i.to_string().into_bytes(),
            Payload::Float(f) => float_text(f).into_bytes(),
            Payload::Bool(b) => b.to_string().into_bytes(),
            Payload::Bytes(bytes) => bytes,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Payload::Absent => serde_json::Value::Null,
            Payload::Text(text) => serde_json::Value::String(text.clone()),
            Payload::Int(i) => serde_json::Value::from(*i),
            Payload::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Payload::Bool(b) => serde_json::Value::Bool(*b),
            Payload::Bytes(bytes) => serde_json::Value::String(
                base64::engine::general_purpose::STANDARD.encode(bytes),
            ),
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Payload::Absent => f.write_str("<absent>"),
            Payload::Text(text) => f.write_str(text),
            Payload::Int(i) => write!(f, "{}", i),
            Payload::Float(v) => f.write_str(&float_text(*v)),
            Payload::Bool(b) => write!(f, "{}", b),
            Payload::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

/// Whole floats keep one decimal (`21.0`) so they stay recognisable as floats.
pub fn float_text(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{:.1}", value)
    } else {
        value.to_string()
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// ASCII-art rendering.
    Txt,
    #[default]
    Png,
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ImageFormat::Txt => f.write_str("txt"),
            ImageFormat::Png => f.write_str("png"),
        }
    }
}

/// Pluggable image support. Returning `None` falls back to string conversion.
pub trait ImageRenderer: Send + Sync {
    fn render(&self, image: &ImageData, format: ImageFormat) -> Option<Payload>;
}

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("JSON message is not a dictionary")]
    NotAnObject,

    #[error("unsupported JSON value: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, Default)]
pub struct CodecOptions {
    pub locale: Option<String>,
    pub timezone: Option<Tz>,
    /// strftime pattern for timestamps.
    pub time_format: Option<String>,
    pub image_format: ImageFormat,
}

#[derive(Clone)]
pub struct ValueCodec {
    options: CodecOptions,
    images: Option<Arc<dyn ImageRenderer>>,
}

impl fmt::Debug for ValueCodec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ValueCodec")
            .field("options", &self.options)
            .field("images", &self.images.is_some())
            .finish()
    }
}

impl ValueCodec {
    /// Codec with the built-in image renderer when the `images` feature is on.
    pub fn new(options: CodecOptions) -> Self {
        let codec = Self::without_images(options);
        #[cfg(feature = "images")]
        let codec = codec.with_image_renderer(Arc::new(BuiltinImageRenderer::default()));
        codec
    }

    pub fn without_images(options: CodecOptions) -> Self {
        Self {
            options,
            images: None,
        }
    }

    pub fn with_image_renderer(mut self, renderer: Arc<dyn ImageRenderer>) -> Self {
        self.images = Some(renderer);
        self
    }

    pub fn locale(&self) -> Option<&str> {
        self.options.locale.as_deref()
    }

    pub fn encode(&self, value: &Value) -> Payload {
        match value {
            Value::None => Payload::Absent,
            Value::Str(text) => Payload::Text(text.clone()),
            Value::Int(i) => Payload::Int(*i),
            Value::Float(f) => Payload::Float(*f),
            Value::Bool(b) => Payload::Bool(*b),
            Value::Enum(member) => Payload::Text(member.clone()),
            Value::List(items) => Payload::Text(
                items
                    .iter()
                    .map(|item| self.encode(item).to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            Value::Timestamp(ts) => Payload::Text(self.format_timestamp(ts)),
            Value::Image(image) => self
                .images
                .as_ref()
                .and_then(|renderer| renderer.render(image, self.options.image_format))
                .unwrap_or_else(|| Payload::Text(value.to_string())),
        }
    }

    /// Converts into the configured timezone and applies the configured pattern.
    pub fn format_timestamp(&self, ts: &DateTime<Utc>) -> String {
        match self.options.timezone {
            Some(tz) => self.format_in(&ts.with_timezone(&tz)),
            None => self.format_in(ts),
        }
    }

    fn format_in<Z: TimeZone>(&self, ts: &DateTime<Z>) -> String
    where
        Z::Offset: fmt::Display,
    {
        if let Some(pattern) = &self.options.time_format {
            let mut out = String::new();
            if write!(out, "{}", ts.format(pattern)).is_ok() {
                return out;
            }
            warn!("Time format '{}' cannot be applied, using default", pattern);
        }
        if ts.nanosecond() == 0 {
            ts.format("%Y-%m-%d %H:%M:%S%:z").to_string()
        } else {
            ts.format("%Y-%m-%d %H:%M:%S%.6f%:z").to_string()
        }
    }

    pub fn decode_text(payload: &[u8]) -> Result<String, CodecError> {
        String::from_utf8(payload.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    pub fn decode_object(
        payload: &[u8],
    ) -> Result<serde_json::Map<String, serde_json::Value>, CodecError> {
        match serde_json::from_slice::<serde_json::Value>(payload) {
            Ok(serde_json::Value::Object(map)) => Ok(map),
            Ok(_) => Err(CodecError::NotAnObject),
            Err(e) => Err(CodecError::InvalidJson(e.to_string())),
        }
    }

    pub fn decode_json_value(value: &serde_json::Value) -> Result<Value, CodecError> {
        match value {
            serde_json::Value::Null => Ok(Value::None),
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(Value::Int(i)),
                None => n
                    .as_f64()
                    .map(Value::Float)
                    .ok_or_else(|| CodecError::Unsupported(n.to_string())),
            },
            serde_json::Value::String(s) => Ok(Value::Str(s.clone())),
            serde_json::Value::Array(items) => items
                .iter()
                .map(Self::decode_json_value)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            serde_json::Value::Object(_) => {
                Err(CodecError::Unsupported("nested object".to_string()))
            }
        }
    }
}

/// PNG via the `image` crate, text via a luminance ramp.
#[cfg(feature = "images")]
#[derive(Debug, Clone)]
pub struct BuiltinImageRenderer {
    pub columns: u32,
}

#[cfg(feature = "images")]
impl Default for BuiltinImageRenderer {
    fn default() -> Self {
        Self { columns: 120 }
    }
}

#[cfg(feature = "images")]
impl BuiltinImageRenderer {
    const RAMP: &'static [u8] = b"@%#*+=-:. ";

    fn ascii_art(&self, image: &ImageData) -> Option<String> {
        if image.width == 0 || image.height == 0 {
            return None;
        }
        let columns = self.columns.min(image.width).max(1);
        let cell_w = image.width as f64 / columns as f64;
        // Terminal cells are roughly twice as tall as they are wide.
        let cell_h = cell_w * 2.0;
        let rows = ((image.height as f64 / cell_h).round() as u32).max(1);

        let mut art = String::with_capacity(((columns + 1) * rows) as usize);
        for row in 0..rows {
            if row > 0 {
                art.push('\n');
            }
            for col in 0..columns {
                let x = ((col as f64 + 0.5) * cell_w) as u32;
                let y = (((row as f64 + 0.5) * cell_h) as u32).min(image.height - 1);
                let [r, g, b, a] = image.pixel(x.min(image.width - 1), y)?;
                if a == 0 {
                    art.push(' ');
                    continue;
                }
                let luma = 0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64;
                let idx = ((luma / 255.0) * (Self::RAMP.len() - 1) as f64).round() as usize;
                art.push(Self::RAMP[idx.min(Self::RAMP.len() - 1)] as char);
            }
        }
        Some(art)
    }

    fn png(&self, image: &ImageData) -> Option<Vec<u8>> {
        let buffer = image::RgbaImage::from_raw(image.width, image.height, image.rgba.clone())?;
        let mut out = std::io::Cursor::new(Vec::new());
        match buffer.write_to(&mut out, image::ImageFormat::Png) {
            Ok(()) => Some(out.into_inner()),
            Err(e) => {
                warn!("PNG encoding failed: {}", e);
                None
            }
        }
    }
}

#[cfg(feature = "images")]
impl ImageRenderer for BuiltinImageRenderer {
    fn render(&self, image: &ImageData, format: ImageFormat) -> Option<Payload> {
        match format {
            ImageFormat::Txt => self.ascii_art(image).map(Payload::Text),
            ImageFormat::Png => self.png(image).map(Payload::Bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
    }

    #[test]
    fn test_scalars_pass_through() {
        let codec = ValueCodec::without_images(CodecOptions::default());
        assert_eq!(codec.encode(&Value::None), Payload::Absent);
        assert_eq!(codec.encode(&Value::Int(42)), Payload::Int(42));
        assert_eq!(codec.encode(&Value::Float(22.5)), Payload::Float(22.5));
        assert_eq!(
            codec.encode(&Value::Str("parked".into())),
            Payload::Text("parked".into())
        );
        assert_eq!(
            codec.encode(&Value::Enum("charging".into())),
            Payload::Text("charging".into())
        );
    }

    #[test]
    fn test_list_is_comma_space_joined() {
        let codec = ValueCodec::without_images(CodecOptions::default());
        let value = Value::List(vec![
            Value::Enum("front_left".into()),
            Value::Int(3),
            Value::Float(2.0),
        ]);
        assert_eq!(
            codec.encode(&value),
            Payload::Text("front_left, 3, 2.0".into())
        );
    }

    #[test]
    fn test_timestamp_default_and_timezone() {
        let codec = ValueCodec::without_images(CodecOptions::default());
        assert_eq!(
            codec.encode(&Value::Timestamp(ts())),
            Payload::Text("2024-05-01 12:30:00+00:00".into())
        );

        let berlin = ValueCodec::without_images(CodecOptions {
            timezone: Some(chrono_tz::Europe::Berlin),
            ..CodecOptions::default()
        });
        assert_eq!(
            berlin.format_timestamp(&ts()),
            "2024-05-01 14:30:00+02:00".to_string()
        );
    }

    #[test]
    fn test_timestamp_pattern() {
        let codec = ValueCodec::without_images(CodecOptions {
            time_format: Some("%d.%m.%Y %H:%M".into()),
            ..CodecOptions::default()
        });
        assert_eq!(codec.format_timestamp(&ts()), "01.05.2024 12:30");
    }

    #[test]
    fn test_broken_pattern_falls_back() {
        let codec = ValueCodec::without_images(CodecOptions {
            time_format: Some("%Q".into()),
            ..CodecOptions::default()
        });
        assert_eq!(codec.format_timestamp(&ts()), "2024-05-01 12:30:00+00:00");
    }

    #[test]
    fn test_image_without_renderer_is_stringified() {
        let codec = ValueCodec::without_images(CodecOptions::default());
        let image = ImageData::new(2, 1, vec![0; 8]);
        assert_eq!(
            codec.encode(&Value::Image(image)),
            Payload::Text("<image 2x1>".into())
        );
    }

    #[cfg(feature = "images")]
    #[test]
    fn test_builtin_renderer_formats() {
        let white = ImageData::new(4, 2, vec![255; 32]);
        let txt = ValueCodec::new(CodecOptions {
            image_format: ImageFormat::Txt,
            ..CodecOptions::default()
        });
        assert_eq!(txt.encode(&Value::Image(white.clone())), Payload::Text("    ".into()));

        let png = ValueCodec::new(CodecOptions::default());
        match png.encode(&Value::Image(white)) {
            Payload::Bytes(bytes) => assert_eq!(&bytes[1..4], b"PNG"),
            other => panic!("expected PNG bytes, got {:?}", other),
        }
    }

    #[test]
    fn test_payload_bytes_and_json() {
        assert!(Payload::Absent.into_bytes().is_empty());
        assert_eq!(Payload::Float(21.0).into_bytes(), b"21.0".to_vec());
        assert_eq!(Payload::Bool(true).into_bytes(), b"true".to_vec());
        assert_eq!(Payload::Absent.to_json(), serde_json::Value::Null);
        assert_eq!(
            Payload::Bytes(vec![1, 2, 3]).to_json(),
            serde_json::json!("AQID")
        );
    }

    #[test]
    fn test_decode_helpers() {
        assert_eq!(ValueCodec::decode_text(b"on"), Ok("on".to_string()));
        assert_eq!(
            ValueCodec::decode_text(&[0xff, 0xfe]),
            Err(CodecError::InvalidUtf8)
        );
        assert_eq!(
            ValueCodec::decode_object(b"[1]"),
            Err(CodecError::NotAnObject)
        );
        assert!(matches!(
            ValueCodec::decode_object(b"{"),
            Err(CodecError::InvalidJson(_))
        ));
        assert_eq!(
            ValueCodec::decode_json_value(&serde_json::json!(22.5)),
            Ok(Value::Float(22.5))
        );
        assert_eq!(
            ValueCodec::decode_json_value(&serde_json::json!([1, "a"])),
            Ok(Value::List(vec![Value::Int(1), Value::Str("a".into())]))
        );
    }
}
