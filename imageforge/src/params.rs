//! Request parameter extraction and validation.
//!
//! The image route carries its parameters in the path
//! (`/id/{id}/{width}/{height}{extension}`) and in the query string
//! (`?blur[={1..10}]&grayscale`). Everything is validated here before any
//! work is scheduled; the public front-end normalizes requests, so anything
//! out of shape at this service is rejected outright with a 400.
//!
//! The validated parameter set also yields the request fingerprint, the
//! canonical string that keys both the rendition cache and the in-flight
//! coalescing map.

use crate::config::{DEFAULT_BLUR, MAX_BLUR, MAX_DIMENSION, MIN_BLUR};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamsError {
    #[error("invalid image id")]
    InvalidId,
    #[error("invalid width")]
    InvalidWidth,
    #[error("invalid height")]
    InvalidHeight,
    #[error("width and height must not exceed {MAX_DIMENSION}")]
    DimensionTooLarge,
    #[error("invalid extension, expected .jpg or .webp")]
    InvalidExtension,
    #[error("invalid blur amount, expected {MIN_BLUR}-{MAX_BLUR}")]
    InvalidBlurAmount,
}

/// Output format, fixed by the requested extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    Jpg,
    Webp,
}

impl Extension {
    /// Parses the extension path suffix. Case-sensitive by contract.
    fn parse(s: &str) -> Result<Self, ParamsError> {
        match s {
            ".jpg" => Ok(Self::Jpg),
            ".webp" => Ok(Self::Webp),
            _ => Err(ParamsError::InvalidExtension),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpg => ".jpg",
            Self::Webp => ".webp",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Jpg => "image/jpeg",
            Self::Webp => "image/webp",
        }
    }
}

/// Validated request parameters, immutable after parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Params {
    pub id: String,
    pub width: u32,
    pub height: u32,
    pub extension: Extension,
    /// Blur amount when blur was requested.
    pub blur: Option<u8>,
    pub grayscale: bool,
}

impl Params {
    /// Parses and validates the raw path segments and query pairs.
    ///
    /// `height_and_extension` is the final path segment, e.g. `300.jpg`:
    /// the router cannot split it because the extension pattern is `.` plus
    /// anything.
    pub fn parse(
        id: &str,
        width: &str,
        height_and_extension: &str,
        query: &[(String, String)],
    ) -> Result<Self, ParamsError> {
        if id.is_empty() {
            return Err(ParamsError::InvalidId);
        }

        let width: u32 = width.parse().map_err(|_| ParamsError::InvalidWidth)?;
        if width == 0 {
            return Err(ParamsError::InvalidWidth);
        }

        let dot = height_and_extension
            .find('.')
            .ok_or(ParamsError::InvalidExtension)?;
        let (height, extension) = height_and_extension.split_at(dot);
        let height: u32 = height.parse().map_err(|_| ParamsError::InvalidHeight)?;
        if height == 0 {
            return Err(ParamsError::InvalidHeight);
        }
        let extension = Extension::parse(extension)?;

        if width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(ParamsError::DimensionTooLarge);
        }

        let mut blur = None;
        let mut grayscale = false;
        for (key, value) in query {
            match key.as_str() {
                "blur" if value.is_empty() => blur = Some(DEFAULT_BLUR),
                "blur" => {
                    let amount: u8 =
                        value.parse().map_err(|_| ParamsError::InvalidBlurAmount)?;
                    if !(MIN_BLUR..=MAX_BLUR).contains(&amount) {
                        return Err(ParamsError::InvalidBlurAmount);
                    }
                    blur = Some(amount);
                }
                "grayscale" => grayscale = true,
                _ => {}
            }
        }

        Ok(Self {
            id: id.to_string(),
            width,
            height,
            extension,
            blur,
            grayscale,
        })
    }

    /// Canonical fingerprint: `{id}-{width}x{height}{ext}[-blur_{n}][-grayscale]`.
    ///
    /// Two requests share a fingerprint exactly when they would produce the
    /// same bytes. The fingerprint is the cache key, the coalescing key and
    /// the download filename.
    pub fn fingerprint(&self) -> String {
        let mut fingerprint = format!(
            "{}-{}x{}{}",
            self.id,
            self.width,
            self.height,
            self.extension.as_str()
        );
        if let Some(amount) = self.blur {
            fingerprint.push_str(&format!("-blur_{amount}"));
        }
        if self.grayscale {
            fingerprint.push_str("-grayscale");
        }
        fingerprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_plain_request() {
        let params = Params::parse("237", "200", "300.jpg", &[]).unwrap();
        assert_eq!(params.id, "237");
        assert_eq!(params.width, 200);
        assert_eq!(params.height, 300);
        assert_eq!(params.extension, Extension::Jpg);
        assert_eq!(params.blur, None);
        assert!(!params.grayscale);
    }

    #[test]
    fn test_parse_webp() {
        let params = Params::parse("7", "100", "100.webp", &[]).unwrap();
        assert_eq!(params.extension, Extension::Webp);
        assert_eq!(params.extension.content_type(), "image/webp");
    }

    #[test]
    fn test_parse_blur_with_amount() {
        let params = Params::parse("1", "100", "100.jpg", &query(&[("blur", "3")])).unwrap();
        assert_eq!(params.blur, Some(3));
    }

    #[test]
    fn test_parse_bare_blur_defaults() {
        let params = Params::parse("1", "100", "100.jpg", &query(&[("blur", "")])).unwrap();
        assert_eq!(params.blur, Some(DEFAULT_BLUR));
    }

    #[test]
    fn test_parse_grayscale_flag() {
        let params =
            Params::parse("1", "100", "100.jpg", &query(&[("grayscale", "")])).unwrap();
        assert!(params.grayscale);
    }

    #[test]
    fn test_blur_out_of_range_rejected() {
        for amount in ["0", "11", "255"] {
            let result = Params::parse("1", "100", "100.jpg", &query(&[("blur", amount)]));
            assert_eq!(result, Err(ParamsError::InvalidBlurAmount), "blur={amount}");
        }
    }

    #[test]
    fn test_blur_non_integer_rejected() {
        let result = Params::parse("1", "100", "100.jpg", &query(&[("blur", "soft")]));
        assert_eq!(result, Err(ParamsError::InvalidBlurAmount));
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        assert_eq!(
            Params::parse("1", "0", "100.jpg", &[]),
            Err(ParamsError::InvalidWidth)
        );
        assert_eq!(
            Params::parse("1", "100", "0.jpg", &[]),
            Err(ParamsError::InvalidHeight)
        );
    }

    #[test]
    fn test_oversized_dimensions_rejected() {
        assert_eq!(
            Params::parse("1", "5001", "100.jpg", &[]),
            Err(ParamsError::DimensionTooLarge)
        );
        assert_eq!(
            Params::parse("1", "100", "5001.jpg", &[]),
            Err(ParamsError::DimensionTooLarge)
        );
        assert!(Params::parse("1", "5000", "5000.jpg", &[]).is_ok());
    }

    #[test]
    fn test_non_numeric_dimensions_rejected() {
        assert_eq!(
            Params::parse("1", "wide", "100.jpg", &[]),
            Err(ParamsError::InvalidWidth)
        );
        assert_eq!(
            Params::parse("1", "100", "tall.jpg", &[]),
            Err(ParamsError::InvalidHeight)
        );
    }

    #[test]
    fn test_extension_case_sensitive() {
        assert_eq!(
            Params::parse("1", "100", "100.JPG", &[]),
            Err(ParamsError::InvalidExtension)
        );
    }

    #[test]
    fn test_unknown_extensions_rejected() {
        for last in ["100.png", "100.gif", "100", "100."] {
            let result = Params::parse("1", "100", last, &[]);
            assert!(result.is_err(), "{last} should be rejected");
        }
    }

    #[test]
    fn test_empty_id_rejected() {
        assert_eq!(
            Params::parse("", "100", "100.jpg", &[]),
            Err(ParamsError::InvalidId)
        );
    }

    #[test]
    fn test_fingerprint_plain() {
        let params = Params::parse("123", "100", "100.jpg", &[]).unwrap();
        assert_eq!(params.fingerprint(), "123-100x100.jpg");
    }

    #[test]
    fn test_fingerprint_with_transforms() {
        let params = Params::parse(
            "7",
            "200",
            "200.webp",
            &query(&[("blur", "3"), ("grayscale", "")]),
        )
        .unwrap();
        assert_eq!(params.fingerprint(), "7-200x200.webp-blur_3-grayscale");
    }

    #[test]
    fn test_fingerprint_distinguishes_blur_amount() {
        let a = Params::parse("7", "100", "100.jpg", &query(&[("blur", "3")])).unwrap();
        let b = Params::parse("7", "100", "100.jpg", &query(&[("blur", "4")])).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_distinguishes_format() {
        let a = Params::parse("7", "100", "100.jpg", &[]).unwrap();
        let b = Params::parse("7", "100", "100.webp", &[]).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
