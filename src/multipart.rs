//! `multipart/form-data` bodies for uploads.
//!
//! Parameters are turned into parts by kind: images go through the configured
//! [`ImageCompressor`], files are read from disk with their MIME type taken
//! from the [`MimeResolver`], lists repeat the field name once per element,
//! and everything else becomes a UTF-8 text part. Any attachment that cannot
//! be produced fails the whole body; no partially built body is returned.

use std::path::Path;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use tracing::warn;

use crate::error::Error;
use crate::params::{Attachment, ImageData, ParamValue, Parameters};

pub const DEFAULT_IMAGE_QUALITY: f32 = 0.7;
pub(crate) const IMAGE_FILE_NAME: &str = "image.jpg";
pub(crate) const IMAGE_CONTENT_TYPE: &str = "image/jpeg";
const OCTET_STREAM: &str = "application/octet-stream";

pub trait MimeResolver: Send + Sync {
    fn resolve(&self, extension: &str) -> String;
}

/// Resolves a handful of common extensions and falls back to
/// `application/octet-stream`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultMimeResolver;

impl MimeResolver for DefaultMimeResolver {
    fn resolve(&self, extension: &str) -> String {
        let mime = match extension.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => "image/jpeg",
            "png" => "image/png",
            "gif" => "image/gif",
            "heic" => "image/heic",
            "webp" => "image/webp",
            "pdf" => "application/pdf",
            "json" => "application/json",
            "zip" => "application/zip",
            "txt" => "text/plain",
            "csv" => "text/csv",
            "mp4" => "video/mp4",
            "mov" => "video/quicktime",
            "mp3" => "audio/mpeg",
            "m4a" => "audio/mp4",
            _ => OCTET_STREAM,
        };
        mime.to_owned()
    }
}

pub trait ImageCompressor: Send + Sync {
    /// Encodes `image` lossily at `quality` in `0.0..=1.0`.
    fn compress(&self, image: &ImageData, quality: f32) -> Result<Bytes, String>;
}

/// Uploads image bytes unchanged; for callers that already hold JPEG data.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughCompressor;

impl ImageCompressor for PassthroughCompressor {
    fn compress(&self, image: &ImageData, _quality: f32) -> Result<Bytes, String> {
        Ok(image.bytes().clone())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartPart {
    pub name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

#[derive(Clone, Debug)]
pub struct MultipartBody {
    boundary: String,
    parts: Vec<MultipartPart>,
}

impl MultipartBody {
    pub fn new() -> Self {
        let mut rng = rand::rng();
        let boundary = format!(
            "reqflow.boundary.{:016x}{:016x}",
            rng.random::<u64>(),
            rng.random::<u64>()
        );
        Self::with_boundary(boundary)
    }

    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            parts: Vec::new(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn parts(&self) -> &[MultipartPart] {
        &self.parts
    }

    pub fn parts_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MultipartPart> {
        self.parts.iter().filter(move |part| part.name == name)
    }

    pub fn append_text(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.parts.push(MultipartPart {
            name: name.into(),
            file_name: None,
            content_type: None,
            data: Bytes::from(value.into()),
        });
    }

    pub fn append_file(
        &mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        data: Bytes,
    ) {
        let content_type = content_type.into();
        self.parts.push(MultipartPart {
            name: name.into(),
            file_name: Some(file_name.into()),
            content_type: (!content_type.is_empty()).then_some(content_type),
            data,
        });
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buffer = BytesMut::new();
        for part in &self.parts {
            buffer.put_slice(b"--");
            buffer.put_slice(self.boundary.as_bytes());
            buffer.put_slice(b"\r\nContent-Disposition: form-data; name=\"");
            buffer.put_slice(escape_quoted(&part.name).as_bytes());
            buffer.put_slice(b"\"");
            if let Some(file_name) = &part.file_name {
                buffer.put_slice(b"; filename=\"");
                buffer.put_slice(escape_quoted(file_name).as_bytes());
                buffer.put_slice(b"\"");
            }
            buffer.put_slice(b"\r\n");
            if let Some(content_type) = &part.content_type {
                buffer.put_slice(b"Content-Type: ");
                buffer.put_slice(content_type.as_bytes());
                buffer.put_slice(b"\r\n");
            }
            buffer.put_slice(b"\r\n");
            buffer.put_slice(&part.data);
            buffer.put_slice(b"\r\n");
        }
        buffer.put_slice(b"--");
        buffer.put_slice(self.boundary.as_bytes());
        buffer.put_slice(b"--\r\n");
        buffer.freeze()
    }
}

impl Default for MultipartBody {
    fn default() -> Self {
        Self::new()
    }
}

fn escape_quoted(value: &str) -> String {
    value
        .replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

#[derive(Clone)]
pub struct MultipartEncoder {
    mime_resolver: Arc<dyn MimeResolver>,
    image_compressor: Arc<dyn ImageCompressor>,
    image_quality: f32,
}

impl MultipartEncoder {
    pub fn new(
        mime_resolver: Arc<dyn MimeResolver>,
        image_compressor: Arc<dyn ImageCompressor>,
        image_quality: f32,
    ) -> Self {
        Self {
            mime_resolver,
            image_compressor,
            image_quality: image_quality.clamp(0.0, 1.0),
        }
    }

    pub fn image_quality(&self) -> f32 {
        self.image_quality
    }

    pub async fn encode(&self, parameters: &Parameters) -> Result<MultipartBody, Error> {
        let mut body = MultipartBody::new();
        for (name, value) in parameters.iter() {
            match value {
                ParamValue::Image(image) => self.append_image(&mut body, name, image)?,
                ParamValue::File(path) => self.append_path(&mut body, name, path).await?,
                ParamValue::List(items) => {
                    for item in items {
                        match item {
                            Attachment::Image(image) => {
                                self.append_image(&mut body, name, image)?
                            }
                            Attachment::File(path) => {
                                self.append_path(&mut body, name, path).await?
                            }
                        }
                    }
                }
                scalar => body.append_text(name, scalar.to_string()),
            }
        }
        Ok(body)
    }

    fn append_image(
        &self,
        body: &mut MultipartBody,
        name: &str,
        image: &ImageData,
    ) -> Result<(), Error> {
        let data = self
            .image_compressor
            .compress(image, self.image_quality)
            .map_err(|message| Error::ImageEncode {
                field: name.to_owned(),
                message,
            })?;
        body.append_file(name, IMAGE_FILE_NAME, IMAGE_CONTENT_TYPE, data);
        Ok(())
    }

    async fn append_path(
        &self,
        body: &mut MultipartBody,
        name: &str,
        path: &Path,
    ) -> Result<(), Error> {
        let data = tokio::fs::read(path).await.map_err(|source| {
            warn!(field = name, path = %path.display(), error = %source, "failed to read upload file");
            Error::ReadFile {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let extension = path
            .extension()
            .map(|extension| extension.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_name = path
            .file_name()
            .map(|file_name| file_name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let content_type = self.mime_resolver.resolve(&extension);
        body.append_file(name, file_name, content_type, Bytes::from(data));
        Ok(())
    }
}

impl Default for MultipartEncoder {
    fn default() -> Self {
        Self::new(
            Arc::new(DefaultMimeResolver),
            Arc::new(PassthroughCompressor),
            DEFAULT_IMAGE_QUALITY,
        )
    }
}

/// Encodes `parameters` with the default MIME resolver and image compressor.
pub async fn encode_multipart(parameters: &Parameters) -> Result<MultipartBody, Error> {
    MultipartEncoder::default().encode(parameters).await
}
