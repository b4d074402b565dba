//! The image field of an analysis request. Clients may either upload a file
//! (multipart/form-data) or send the image bytes as a base64 string; both
//! end up as a validated `RawFile` before anything else touches them.

use base64::alphabet;
use base64::engine::{GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use image::io::Reader as ImageReader;
use image::ImageFormat;
use rand::{distributions::Alphanumeric, Rng};
use std::fmt::Debug;
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Length of the random part of a generated filename
const NAME_LENGTH: usize = 12;

/// Standard alphabet with padding. Non-zero bits after the last byte are
/// ignored rather than rejected.
const BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

/// Why the `image` field was rejected. The `Display` output is the message
/// returned to the client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageFieldError {
    #[error("No file was submitted.")]
    Missing,

    #[error("This field may not be null.")]
    Null,

    #[error("The submitted data was not a file. Check the encoding type on the form.")]
    NotAFile,

    #[error("No filename could be determined.")]
    NoName,

    #[error("The submitted file is empty.")]
    Empty,

    #[error(
        "Upload a valid image. The file you uploaded was either not an image or a corrupted image."
    )]
    Invalid,
}

/// An uploaded file: its content and the name it should be stored under
#[derive(Clone, PartialEq, Eq)]
pub struct RawFile {
    pub name: String,
    pub content: Vec<u8>,
}

impl RawFile {
    pub fn new(name: impl Into<String>, content: Vec<u8>) -> Self {
        RawFile {
            name: name.into(),
            content,
        }
    }
}

impl Debug for RawFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RawFile {{ name: {:?}, content: <{} bytes> }}",
            self.name,
            self.content.len()
        )
    }
}

/// The two shapes the `image` field can arrive in
#[derive(Clone, PartialEq, Eq)]
pub enum ImageInput {
    RawFile(RawFile),
    Base64(String),
}

impl Debug for ImageInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageInput::RawFile(file) => write!(f, "ImageInput::RawFile({file:?})"),
            ImageInput::Base64(data) => {
                write!(f, "ImageInput::Base64(<{} chars>)", data.len())
            }
        }
    }
}

/// Resolve an `ImageInput` into a validated `RawFile`.
///
/// Base64 input is decoded, checked to be an image and given a generated
/// name `<random>.<format>`. Uploaded files keep the last component of their
/// name. Both go through `check_content` exactly once.
pub fn normalize(input: ImageInput) -> Result<RawFile, ImageFieldError> {
    match input {
        ImageInput::RawFile(file) => validate_file(file),
        ImageInput::Base64(data) => decode_base64(&data),
    }
}

/// Checks for an uploaded file: a usable name, non-empty content and bytes
/// that decode as an image.
pub fn validate_file(file: RawFile) -> Result<RawFile, ImageFieldError> {
    // Only keep the last path component of whatever the client sent
    let name = Path::new(&file.name)
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .ok_or(ImageFieldError::NoName)?;

    check_content(&file.content)?;

    Ok(RawFile {
        name,
        content: file.content,
    })
}

fn decode_base64(data: &str) -> Result<RawFile, ImageFieldError> {
    let compact: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let content = BASE64.decode(compact).map_err(|err| {
        warn!("no valid image file could be decoded: {err}");
        ImageFieldError::Invalid
    })?;

    // An empty string is not a file at all
    if content.is_empty() {
        warn!("no valid image file could be decoded: empty input");
        return Err(ImageFieldError::Invalid);
    }

    let format = check_content(&content)?;
    let name = generate_name(format);
    info!("generated filename for base64 encoded file: {name}");

    Ok(RawFile::new(name, content))
}

/// Content checks shared by both input modes. Returns the detected format.
fn check_content(content: &[u8]) -> Result<ImageFormat, ImageFieldError> {
    if content.is_empty() {
        return Err(ImageFieldError::Empty);
    }
    verify_image(content)
}

/// Fully decode `content`, failing on unknown formats and corrupt data
fn verify_image(content: &[u8]) -> Result<ImageFormat, ImageFieldError> {
    #[cfg(test)]
    tests::VERIFICATIONS.with(|count| count.set(count.get() + 1));

    let reader = ImageReader::new(Cursor::new(content))
        .with_guessed_format()
        .map_err(|err| {
            warn!("no valid image file could be decoded: {err}");
            ImageFieldError::Invalid
        })?;

    let format = match reader.format() {
        Some(format) => format,
        None => {
            warn!("no valid image file could be decoded: unknown format");
            return Err(ImageFieldError::Invalid);
        }
    };

    reader.decode().map_err(|err| {
        warn!("no valid image file could be decoded: {err}");
        ImageFieldError::Invalid
    })?;

    Ok(format)
}

/// A random name with the lowercase format name as extension
fn generate_name(format: ImageFormat) -> String {
    let id: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NAME_LENGTH)
        .collect();
    format!("{}.{}", id.to_lowercase(), format_extension(format))
}

/// Lowercase format name, e.g. `jpeg` rather than `jpg`
pub fn format_extension(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "png",
        ImageFormat::Jpeg => "jpeg",
        ImageFormat::Gif => "gif",
        ImageFormat::WebP => "webp",
        ImageFormat::Pnm => "ppm",
        ImageFormat::Tiff => "tiff",
        ImageFormat::Tga => "tga",
        ImageFormat::Bmp => "bmp",
        ImageFormat::Ico => "ico",
        other => other.extensions_str().first().copied().unwrap_or("img"),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use base64::engine::general_purpose;
    use base64::Engine as _;
    use image::{ImageBuffer, ImageOutputFormat, Rgb};
    use std::cell::Cell;

    thread_local! {
        /// Full decodes done by `verify_image` on this thread
        pub(super) static VERIFICATIONS: Cell<usize> = Cell::new(0);
    }

    fn verifications() -> usize {
        VERIFICATIONS.with(Cell::get)
    }

    /// A 1x1 pixel GIF
    pub const BASE64_ENCODED_GIF: &str = "R0lGODdhAQABAIAAAP///////ywAAAAAAQABAAACAkQBADs=";

    pub fn encode_test_image(format: ImageOutputFormat) -> Vec<u8> {
        let image: ImageBuffer<Rgb<u8>, _> =
            ImageBuffer::from_fn(4, 3, |x, y| Rgb([(x * 60) as u8, (y * 80) as u8, 128]));
        let mut data = Vec::new();
        image.write_to(&mut Cursor::new(&mut data), format).unwrap();
        data
    }

    fn b64(data: &[u8]) -> String {
        general_purpose::STANDARD.encode(data)
    }

    #[test]
    fn test_base64_gif() {
        let file = normalize(ImageInput::Base64(BASE64_ENCODED_GIF.into())).unwrap();
        assert!(file.name.ends_with(".gif"));
        assert_eq!(
            file.content,
            general_purpose::STANDARD.decode(BASE64_ENCODED_GIF).unwrap()
        );
    }

    #[test]
    fn test_base64_extension_matches_format() {
        let png = encode_test_image(ImageOutputFormat::Png);
        let file = normalize(ImageInput::Base64(b64(&png))).unwrap();
        assert!(file.name.ends_with(".png"), "{}", file.name);
        assert_eq!(file.content, png);

        let jpeg = encode_test_image(ImageOutputFormat::Jpeg(90));
        let file = normalize(ImageInput::Base64(b64(&jpeg))).unwrap();
        assert!(file.name.ends_with(".jpeg"), "{}", file.name);
    }

    #[test]
    fn test_generated_names() {
        let a = normalize(ImageInput::Base64(BASE64_ENCODED_GIF.into())).unwrap();
        let b = normalize(ImageInput::Base64(BASE64_ENCODED_GIF.into())).unwrap();
        assert_eq!(a.name.len(), NAME_LENGTH + ".gif".len());
        assert_ne!(a.name, b.name);
    }

    #[test]
    fn test_base64_with_line_breaks() {
        let png = b64(&encode_test_image(ImageOutputFormat::Png));
        let wrapped = png
            .as_bytes()
            .chunks(16)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect::<Vec<_>>()
            .join("\n");
        assert!(normalize(ImageInput::Base64(wrapped)).is_ok());
    }

    #[test]
    fn test_malformed_and_non_image_base64_match() {
        let malformed = normalize(ImageInput::Base64("I'm no image".into())).unwrap_err();
        let not_an_image = normalize(ImageInput::Base64(b64(b"just some text"))).unwrap_err();
        let empty = normalize(ImageInput::Base64(String::new())).unwrap_err();
        assert_eq!(malformed, ImageFieldError::Invalid);
        assert_eq!(malformed.to_string(), not_an_image.to_string());
        assert_eq!(empty, ImageFieldError::Invalid);
    }

    #[test]
    fn test_truncated_image() {
        let png = encode_test_image(ImageOutputFormat::Png);
        let truncated = png[..png.len() / 2].to_vec();
        let err = normalize(ImageInput::RawFile(RawFile::new("cut.png", truncated))).unwrap_err();
        assert_eq!(err, ImageFieldError::Invalid);
    }

    #[test]
    fn test_raw_file_keeps_name() {
        let png = encode_test_image(ImageOutputFormat::Png);
        let file = normalize(ImageInput::RawFile(RawFile::new("../../etc/cat.png", png))).unwrap();
        assert_eq!(file.name, "cat.png");
    }

    #[test]
    fn test_raw_file_errors() {
        let err = normalize(ImageInput::RawFile(RawFile::new("empty.png", vec![]))).unwrap_err();
        assert_eq!(err.to_string(), "The submitted file is empty.");

        let err =
            normalize(ImageInput::RawFile(RawFile::new("x.png", b"no image".to_vec()))).unwrap_err();
        assert_eq!(err, ImageFieldError::Invalid);
        assert_ne!(err.to_string(), ImageFieldError::Empty.to_string());

        let err = normalize(ImageInput::RawFile(RawFile::new("", vec![1]))).unwrap_err();
        assert_eq!(err, ImageFieldError::NoName);
    }

    #[test]
    fn test_image_decoded_once() {
        let jpeg = encode_test_image(ImageOutputFormat::Jpeg(90));

        let before = verifications();
        normalize(ImageInput::Base64(b64(&jpeg))).unwrap();
        assert_eq!(verifications() - before, 1);

        let before = verifications();
        normalize(ImageInput::RawFile(RawFile::new("a.jpeg", jpeg))).unwrap();
        assert_eq!(verifications() - before, 1);
    }

    #[test]
    fn test_base64_trailing_bits() {
        // Same bytes as the GIF, but the last data character carries a set
        // bit beyond the final byte
        let loose = BASE64_ENCODED_GIF.replace("ADs=", "ADt=");
        let file = normalize(ImageInput::Base64(loose)).unwrap();
        assert_eq!(
            file.content,
            general_purpose::STANDARD.decode(BASE64_ENCODED_GIF).unwrap()
        );
    }

    #[test]
    fn test_debug_hides_content() {
        let input = ImageInput::Base64(BASE64_ENCODED_GIF.into());
        assert!(!format!("{input:?}").contains("R0lG"));
    }
}
