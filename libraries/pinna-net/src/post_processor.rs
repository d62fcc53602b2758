//! Post-processors turn response bytes into domain values.
//!
//! A post-processor is a plain function value
//! `Possibility<I> × context → Possibility<O>`. Processors compose with
//! [`chain`], where empty and error inputs skip the later stage.

use crate::request::{HttpResponse, RequestDescriptor};
use bytes::Bytes;
use pinna_core::{Error, Possibility};
use serde::de::DeserializeOwned;
use std::io::Cursor;
use std::sync::Arc;

/// What a post-processor knows about the request it processes.
#[derive(Debug, Clone, Copy)]
pub struct PostProcessContext<'a> {
    pub request: &'a RequestDescriptor,
    /// `None` when the bytes came from the cache
    pub response: Option<&'a HttpResponse>,
    pub cache_identifier: Option<&'a str>,
}

/// A reusable, shareable post-processing function.
pub type PostProcessor<I, O> =
    Arc<dyn Fn(Possibility<I>, &PostProcessContext<'_>) -> Possibility<O> + Send + Sync>;

/// Wrap a closure as a [`PostProcessor`].
pub fn from_fn<I, O, F>(f: F) -> PostProcessor<I, O>
where
    F: Fn(Possibility<I>, &PostProcessContext<'_>) -> Possibility<O> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Build a processor that decodes values and passes empty and error through.
fn decoding<O: 'static>(
    decode: impl Fn(&Bytes) -> Result<O, Error> + Send + Sync + 'static,
) -> PostProcessor<Bytes, O> {
    from_fn(move |input: Possibility<Bytes>, _context| {
        input.refine_value(|bytes| match decode(&bytes) {
            Ok(value) => Possibility::Value(value),
            Err(error) => Possibility::Error(error),
        })
    })
}

/// Hands the bytes through untouched.
pub fn data() -> PostProcessor<Bytes, Bytes> {
    from_fn(|input, _context| input)
}

/// Decodes JSON into `T`.
pub fn json<T: DeserializeOwned + 'static>() -> PostProcessor<Bytes, T> {
    decoding(|bytes| serde_json::from_slice(bytes).map_err(|e| Error::decode(format!("JSON: {}", e))))
}

/// Decodes JSON into an untyped value.
pub fn json_value() -> PostProcessor<Bytes, serde_json::Value> {
    json()
}

/// Decodes a property list (XML or binary).
pub fn property_list() -> PostProcessor<Bytes, plist::Value> {
    decoding(|bytes| {
        plist::Value::from_reader(Cursor::new(bytes.as_ref()))
            .map_err(|e| Error::decode(format!("property list: {}", e)))
    })
}

/// Encoded image bytes with their detected type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub bytes: Bytes,
    pub mime_type: &'static str,
}

const IMAGE_SIGNATURES: &[(&[u8], &str)] = &[
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"BM", "image/bmp"),
    (b"II*\0", "image/tiff"),
    (b"MM\0*", "image/tiff"),
];

/// Detect an image format from its leading bytes.
pub fn sniff_image_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    IMAGE_SIGNATURES
        .iter()
        .find(|(signature, _)| bytes.starts_with(signature))
        .map(|(_, mime_type)| *mime_type)
}

/// Accepts payloads that are a recognised image format.
pub fn image() -> PostProcessor<Bytes, ImageData> {
    decoding(|bytes| match sniff_image_type(bytes) {
        Some(mime_type) => Ok(ImageData {
            bytes: bytes.clone(),
            mime_type,
        }),
        None => Err(Error::decode("unrecognised image format")),
    })
}

/// Feed the output of `source` into `refiner`.
///
/// `refiner` only runs when `source` produced a value.
pub fn chain<A, B, C>(source: PostProcessor<A, B>, refiner: PostProcessor<B, C>) -> PostProcessor<A, C>
where
    A: 'static,
    B: 'static,
    C: 'static,
{
    from_fn(move |input, context| match source(input, context) {
        Possibility::Value(value) => refiner(Possibility::Value(value), context),
        Possibility::Error(error) => Possibility::Error(error),
        Possibility::Empty => Possibility::Empty,
    })
}
