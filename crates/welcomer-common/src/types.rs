//! Request, response and record types
//!
//! Everything here crosses a boundary: the JSON body of `POST /images`, the
//! JSON envelope returned for persisted images, and the record kept in the
//! artifact index.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Encoded image container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Gif,
    Jpeg,
}

impl ImageFormat {
    /// File extension without the dot
    #[must_use]
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Jpeg => "jpg",
        }
    }

    #[must_use]
    pub const fn content_type(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Jpeg => "image/jpeg",
        }
    }

    /// Detect a format from a file extension (case-insensitive)
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(Self::Png),
            "gif" => Some(Self::Gif),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            _ => None,
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Straight-alpha RGBA colour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Colour {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Colour {
    pub const WHITE: Self = Self::rgb(255, 255, 255);
    pub const BLACK: Self = Self::rgb(0, 0, 0);

    #[must_use]
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    #[must_use]
    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    #[must_use]
    pub const fn to_array(self) -> [u8; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

/// Parses `#RRGGBB` or `#AARRGGBB`; the leading `#` is optional.
impl FromStr for Colour {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s.trim().trim_start_matches('#');
        let bytes =
            hex::decode(digits).map_err(|_| Error::InvalidColour(s.to_string()))?;
        match bytes.as_slice() {
            [r, g, b] => Ok(Self::rgb(*r, *g, *b)),
            [a, r, g, b] => Ok(Self::rgba(*r, *g, *b, *a)),
            _ => Err(Error::InvalidColour(s.to_string())),
        }
    }
}

impl fmt::Display for Colour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.a == 255 {
            write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
        } else {
            write!(
                f,
                "#{:02X}{:02X}{:02X}{:02X}",
                self.a, self.r, self.g, self.b
            )
        }
    }
}

impl Serialize for Colour {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// An absent or empty colour string means "use the default".
fn optional_colour<'de, D>(deserializer: D) -> std::result::Result<Option<Colour>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// Integer-tagged option enums, as sent by the bot.
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        #[serde(try_from = "u8", into = "u8")]
        pub enum $name {
            #[default]
            $($variant),+
        }

        impl TryFrom<u8> for $name {
            type Error = String;

            fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
                match value {
                    $($value => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} value {}", stringify!($name), other)),
                }
            }
        }

        impl From<$name> for u8 {
            fn from(value: $name) -> u8 {
                match value {
                    $($name::$variant => $value,)+
                }
            }
        }
    };
}

wire_enum!(
    /// Layout used to arrange the avatar and text
    Theme { Regular = 0, Badge = 1, Vertical = 2 }
);

wire_enum!(
    /// Side of the image the avatar sits on (regular theme)
    ProfileAlignment { Left = 0, Right = 1 }
);

wire_enum!(
    /// Shape of the avatar mask and border
    ProfileBorderCurve { Circle = 0, Soft = 1, Square = 2 }
);

wire_enum!(
    HorizontalAlignment { Left = 0, Middle = 1, Right = 2 }
);

wire_enum!(
    VerticalAlignment { Center = 1, Top = 0, Bottom = 2 }
);

/// Generation parameters (the `options` object of `POST /images`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageOptions {
    /// Message, newline separated
    pub text: String,
    pub guild_id: u64,
    pub user_id: u64,
    /// Avatar hash on the CDN
    pub avatar: String,
    /// Permit animated output when the background is animated
    pub allow_gif: bool,
    #[serde(rename = "layout")]
    pub theme: Theme,
    /// Background name; empty means `default`
    pub background: String,
    pub font: String,
    #[serde(deserialize_with = "optional_colour")]
    pub border_colour: Option<Colour>,
    pub border_width: u32,
    pub profile_alignment: ProfileAlignment,
    #[serde(deserialize_with = "optional_colour")]
    pub profile_border_colour: Option<Colour>,
    pub profile_border_width: u32,
    pub profile_border_curve: ProfileBorderCurve,
    pub text_alignment_x: HorizontalAlignment,
    pub text_alignment_y: VerticalAlignment,
    /// Stroke width around glyphs; 0 disables it
    pub text_stroke: u32,
    #[serde(deserialize_with = "optional_colour")]
    pub text_stroke_colour: Option<Colour>,
    #[serde(deserialize_with = "optional_colour")]
    pub text_colour: Option<Colour>,
}

/// Upper bound on the border and stroke widths accepted from callers
pub const MAX_DECORATION_WIDTH: u32 = 64;

impl ImageOptions {
    /// Reject parameters no layout can honour.
    pub fn validate(&self) -> Result<()> {
        if self.border_width > MAX_DECORATION_WIDTH {
            return Err(Error::invalid_request(format!(
                "border_width must be at most {MAX_DECORATION_WIDTH}"
            )));
        }
        if self.profile_border_width > MAX_DECORATION_WIDTH {
            return Err(Error::invalid_request(format!(
                "profile_border_width must be at most {MAX_DECORATION_WIDTH}"
            )));
        }
        if self.text_stroke > MAX_DECORATION_WIDTH {
            return Err(Error::invalid_request(format!(
                "text_stroke must be at most {MAX_DECORATION_WIDTH}"
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn border_colour(&self) -> Colour {
        self.border_colour.unwrap_or(Colour::WHITE)
    }

    #[must_use]
    pub fn profile_border_colour(&self) -> Colour {
        self.profile_border_colour.unwrap_or(Colour::WHITE)
    }

    #[must_use]
    pub fn text_stroke_colour(&self) -> Colour {
        self.text_stroke_colour.unwrap_or(Colour::BLACK)
    }

    #[must_use]
    pub fn text_colour(&self) -> Colour {
        self.text_colour.unwrap_or(Colour::WHITE)
    }
}

/// Body of `POST /images`
///
/// The image is persisted when `force_cache` is set or the encoded size is at
/// least `filesize_limit` bytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageCreateRequest {
    pub force_cache: bool,
    pub filesize_limit: usize,
    pub options: ImageOptions,
}

impl ImageCreateRequest {
    #[must_use]
    pub const fn should_persist(&self, encoded_len: usize) -> bool {
        self.force_cache || encoded_len >= self.filesize_limit
    }
}

/// Envelope returned by `POST /images` for persisted images and for errors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageCreateResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bookmarkable_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_data: Option<ArtifactRecord>,
}

impl ImageCreateResponse {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            bookmarkable_url: None,
            image_data: None,
        }
    }

    #[must_use]
    pub const fn stored(bookmarkable_url: String, record: ArtifactRecord) -> Self {
        Self {
            success: true,
            message: None,
            bookmarkable_url: Some(bookmarkable_url),
            image_data: Some(record),
        }
    }
}

/// Metadata of a persisted image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Content-derived identifier
    pub id: String,
    pub guild_id: u64,
    /// Encoded size in bytes
    pub size: u64,
    /// Path relative to the store folder
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set only on the synthetic record describing the default image
    #[serde(skip)]
    pub is_default: bool,
}

impl ArtifactRecord {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Format implied by the stored file name
    #[must_use]
    pub fn format(&self) -> Option<ImageFormat> {
        std::path::Path::new(&self.path)
            .extension()
            .and_then(|e| e.to_str())
            .and_then(ImageFormat::from_extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_colour_parse() {
        assert_eq!("#FF0000".parse::<Colour>().unwrap(), Colour::rgb(255, 0, 0));
        assert_eq!("00ff00".parse::<Colour>().unwrap(), Colour::rgb(0, 255, 0));
        assert_eq!(
            "#800000FF".parse::<Colour>().unwrap(),
            Colour::rgba(0, 0, 255, 0x80)
        );
        assert!("#12345".parse::<Colour>().is_err());
        assert!("#GG0000".parse::<Colour>().is_err());
    }

    #[test]
    fn test_colour_display() {
        assert_eq!(Colour::rgb(1, 2, 3).to_string(), "#010203");
        assert_eq!(Colour::rgba(1, 2, 3, 4).to_string(), "#04010203");
    }

    #[test]
    fn test_request_decoding() {
        let body = r##"{
            "force_cache": false,
            "filesize_limit": 1000,
            "options": {
                "text": "Welcome\nfriend",
                "guild_id": 341685098468343822,
                "user_id": 143090142360371200,
                "avatar": "abcdef",
                "allow_gif": true,
                "layout": 2,
                "background": "autumn",
                "font": "Inter",
                "border_colour": "",
                "border_width": 4,
                "profile_alignment": 1,
                "profile_border_colour": "#FFFFFF",
                "profile_border_width": 8,
                "profile_border_curve": 1,
                "text_stroke": 3,
                "text_stroke_colour": "#000000",
                "text_colour": "#FFFFFF"
            }
        }"##;
        let request: ImageCreateRequest = serde_json::from_str(body).unwrap();
        assert_eq!(request.filesize_limit, 1000);
        assert_eq!(request.options.theme, Theme::Vertical);
        assert_eq!(request.options.profile_alignment, ProfileAlignment::Right);
        assert_eq!(request.options.profile_border_curve, ProfileBorderCurve::Soft);
        assert_eq!(request.options.border_colour, None);
        assert_eq!(request.options.border_colour(), Colour::WHITE);
        assert_eq!(request.options.text_alignment_y, VerticalAlignment::Center);
        assert!(request.options.validate().is_ok());
    }

    #[test]
    fn test_request_rejects_unknown_layout_and_bad_colour() {
        let bad_layout = r#"{"options": {"layout": 9}}"#;
        assert!(serde_json::from_str::<ImageCreateRequest>(bad_layout).is_err());

        let bad_colour = r##"{"options": {"text_colour": "#nothex"}}"##;
        assert!(serde_json::from_str::<ImageCreateRequest>(bad_colour).is_err());
    }

    #[test]
    fn test_should_persist() {
        let mut request = ImageCreateRequest {
            filesize_limit: 1000,
            ..ImageCreateRequest::default()
        };
        assert!(!request.should_persist(900));
        assert!(request.should_persist(1000));
        assert!(request.should_persist(1200));

        request.force_cache = true;
        assert!(request.should_persist(1));
    }

    #[test]
    fn test_options_validate_bounds() {
        let options = ImageOptions {
            text_stroke: MAX_DECORATION_WIDTH + 1,
            ..ImageOptions::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_record_json_skips_default_flag() {
        let now = Utc::now();
        let record = ArtifactRecord {
            id: "abc".into(),
            guild_id: 1,
            size: 10,
            path: "abc.gif".into(),
            created_at: now,
            expires_at: now + Duration::days(7),
            is_default: true,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("is_default"));

        let decoded: ArtifactRecord = serde_json::from_str(&json).unwrap();
        assert!(!decoded.is_default);
        assert_eq!(decoded.format(), Some(ImageFormat::Gif));
        assert!(!decoded.is_expired(now));
        assert!(decoded.is_expired(now + Duration::days(8)));
    }
}
