//! Conversion options requested for each uploaded file

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Largest width or height a caller may request
pub const MAX_TARGET_DIMENSION: u32 = 16_384;

/// Target encoding for a converted image
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[serde(alias = "jpg")]
    Jpeg,
    Png,
    Webp,
    Gif,
    Bmp,
    #[serde(alias = "tif")]
    Tiff,
}

impl OutputFormat {
    /// All supported targets
    pub const ALL: [OutputFormat; 6] = [
        Self::Jpeg,
        Self::Png,
        Self::Webp,
        Self::Gif,
        Self::Bmp,
        Self::Tiff,
    ];

    /// File extension written for this format
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Webp => "webp",
            Self::Gif => "gif",
            Self::Bmp => "bmp",
            Self::Tiff => "tiff",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            "webp" => Ok(Self::Webp),
            "gif" => Ok(Self::Gif),
            "bmp" => Ok(Self::Bmp),
            "tiff" | "tif" => Ok(Self::Tiff),
            other => Err(Error::UnsupportedFormat(other.to_string())),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Webp => "webp",
            Self::Gif => "gif",
            Self::Bmp => "bmp",
            Self::Tiff => "tiff",
        })
    }
}

/// How the image is fitted when both width and height are given
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResizeFit {
    /// Keep aspect ratio, fit within the box
    #[default]
    Inside,
    /// Stretch to exactly the requested box
    Fill,
}

/// Validated conversion parameters for one task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversionOptions {
    pub format: OutputFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// 1-100, only used by lossy encoders
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    #[serde(default)]
    pub fit: ResizeFit,
}

impl ConversionOptions {
    /// Options that only change the format
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            width: None,
            height: None,
            quality: None,
            fit: ResizeFit::default(),
        }
    }

    pub fn with_size(mut self, width: Option<u32>, height: Option<u32>) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn with_fit(mut self, fit: ResizeFit) -> Self {
        self.fit = fit;
        self
    }

    /// Check ranges. Runs before a task is created; tasks never re-validate.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("width", self.width), ("height", self.height)] {
            if let Some(v) = value {
                if v == 0 || v > MAX_TARGET_DIMENSION {
                    return Err(Error::validation(format!(
                        "{} must be between 1 and {}, got {}",
                        name, MAX_TARGET_DIMENSION, v
                    )));
                }
            }
        }

        if let Some(q) = self.quality {
            if !(1..=100).contains(&q) {
                return Err(Error::validation(format!(
                    "quality must be between 1 and 100, got {}",
                    q
                )));
            }
        }

        Ok(())
    }

    /// Quality to encode with, falling back to the configured default
    pub fn effective_quality(&self, default_quality: u8) -> u8 {
        self.quality.unwrap_or(default_quality).clamp(1, 100)
    }
}

/// Loosely typed options as sent by clients, before validation
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OptionsRequest {
    pub format: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality: Option<u8>,
    pub fit: Option<ResizeFit>,
}

impl OptionsRequest {
    /// Parse and validate into [`ConversionOptions`]
    pub fn into_options(self) -> Result<ConversionOptions> {
        let format = self
            .format
            .as_deref()
            .ok_or_else(|| Error::validation("format is required"))?
            .parse::<OutputFormat>()?;

        let options = ConversionOptions {
            format,
            width: self.width,
            height: self.height,
            quality: self.quality,
            fit: self.fit.unwrap_or_default(),
        };
        options.validate()?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parsing() {
        assert_eq!("JPG".parse::<OutputFormat>().unwrap(), OutputFormat::Jpeg);
        assert_eq!("tif".parse::<OutputFormat>().unwrap(), OutputFormat::Tiff);
        assert!(matches!(
            "heic".parse::<OutputFormat>(),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_validate_ranges() {
        let ok = ConversionOptions::new(OutputFormat::Png).with_size(Some(800), None);
        assert!(ok.validate().is_ok());

        let zero = ConversionOptions::new(OutputFormat::Png).with_size(Some(0), None);
        assert!(matches!(zero.validate(), Err(Error::Validation(_))));

        let huge = ConversionOptions::new(OutputFormat::Png).with_size(None, Some(MAX_TARGET_DIMENSION + 1));
        assert!(huge.validate().is_err());

        let bad_quality = ConversionOptions::new(OutputFormat::Jpeg).with_quality(0);
        assert!(bad_quality.validate().is_err());
    }

    #[test]
    fn test_options_request() {
        let req: OptionsRequest =
            serde_json::from_str(r#"{"format":"webp","width":320,"fit":"fill"}"#).unwrap();
        let options = req.into_options().unwrap();
        assert_eq!(options.format, OutputFormat::Webp);
        assert_eq!(options.width, Some(320));
        assert_eq!(options.fit, ResizeFit::Fill);

        let missing = OptionsRequest::default().into_options();
        assert!(matches!(missing, Err(Error::Validation(_))));
    }

    #[test]
    fn test_effective_quality() {
        let options = ConversionOptions::new(OutputFormat::Jpeg);
        assert_eq!(options.effective_quality(80), 80);
        assert_eq!(options.with_quality(55).effective_quality(80), 55);
    }
}
