//! Immutable face templates and their binary encoding.
//!
//! Encoding (all integers little-endian):
//!
//! ```text
//! "FRTP" | format u8 | name_len u8 | name | version u32 | payload_len u32 | payload (f32 LE)
//! ```
//!
//! Several templates may be written back to back into one stream.

use crate::error::{Error, Result};
use crate::types::{Embedding, Similarity};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

const MAGIC: &[u8; 4] = b"FRTP";
const FORMAT_VERSION: u8 = 1;

/// Upper bound on a single payload; guards allocation when reading untrusted bytes.
const MAX_PAYLOAD_BYTES: u32 = 1 << 20;

/// Extraction method a template was produced with. Templates of different
/// methods are never compared.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Method {
    pub name: String,
    pub version: u32,
}

impl Method {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// Fails with `MethodMismatch` when `other` differs from `self`.
    pub fn ensure_same(&self, other: &Method) -> Result<()> {
        if self == other {
            Ok(())
        } else {
            Err(Error::MethodMismatch {
                expected: self.to_string(),
                found: other.to_string(),
            })
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.name, self.version)
    }
}

#[derive(Debug)]
struct TemplateData {
    method: Method,
    embedding: Embedding,
}

/// Shared, immutable template. Cloning is cheap and never copies the payload.
#[derive(Debug, Clone)]
pub struct ContextTemplate {
    inner: Arc<TemplateData>,
}

impl PartialEq for ContextTemplate {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || (self.inner.method == other.inner.method
                && self.inner.embedding == other.inner.embedding)
    }
}

impl ContextTemplate {
    pub fn new(method: Method, embedding: Embedding) -> Self {
        Self {
            inner: Arc::new(TemplateData { method, embedding }),
        }
    }

    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    pub fn method_name(&self) -> &str {
        &self.inner.method.name
    }

    pub fn version(&self) -> u32 {
        self.inner.method.version
    }

    pub fn embedding(&self) -> &Embedding {
        &self.inner.embedding
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.inner.embedding.values.len() * std::mem::size_of::<f32>()
    }

    /// Fails with `MethodMismatch` unless `other` has the same method and payload size.
    pub fn ensure_comparable(&self, other: &ContextTemplate) -> Result<()> {
        self.method().ensure_same(other.method())?;
        if self.size() != other.size() {
            return Err(Error::MethodMismatch {
                expected: format!("{} with {} byte payload", self.method(), self.size()),
                found: format!("{} with {} byte payload", other.method(), other.size()),
            });
        }
        Ok(())
    }

    /// Compare two templates produced by the same method.
    pub fn compare(&self, other: &ContextTemplate) -> Result<Similarity> {
        self.ensure_comparable(other)?;
        Ok(Similarity::between(self.embedding(), other.embedding()))
    }

    pub fn save<W: Write>(&self, mut writer: W) -> Result<()> {
        let name = self.method_name().as_bytes();
        let name_len = u8::try_from(name.len())
            .map_err(|_| Error::Config(format!("method name too long: {} bytes", name.len())))?;
        let payload_len = u32::try_from(self.size())
            .ok()
            .filter(|len| *len <= MAX_PAYLOAD_BYTES)
            .ok_or_else(|| Error::Config(format!("template payload too large: {} bytes", self.size())))?;

        writer.write_all(MAGIC)?;
        writer.write_u8(FORMAT_VERSION)?;
        writer.write_u8(name_len)?;
        writer.write_all(name)?;
        writer.write_u32::<LittleEndian>(self.version())?;
        writer.write_u32::<LittleEndian>(payload_len)?;
        for v in &self.inner.embedding.values {
            writer.write_f32::<LittleEndian>(*v)?;
        }
        Ok(())
    }

    /// Read exactly one template from `reader`.
    pub fn load<R: Read>(mut reader: R) -> Result<Self> {
        Self::read_one(&mut reader).map_err(truncation_is_corruption)
    }

    fn read_one<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::CorruptData("bad template magic".into()));
        }
        let format = reader.read_u8()?;
        if format != FORMAT_VERSION {
            return Err(Error::CorruptData(format!("unsupported template format {format}")));
        }

        let name_len = reader.read_u8()? as usize;
        let mut name = vec![0u8; name_len];
        reader.read_exact(&mut name)?;
        let name = String::from_utf8(name)
            .map_err(|_| Error::CorruptData("template method name is not UTF-8".into()))?;
        let version = reader.read_u32::<LittleEndian>()?;

        let payload_len = reader.read_u32::<LittleEndian>()?;
        if payload_len > MAX_PAYLOAD_BYTES || payload_len % 4 != 0 {
            return Err(Error::CorruptData(format!("invalid template payload length {payload_len}")));
        }
        let mut values = vec![0f32; payload_len as usize / 4];
        reader.read_f32_into::<LittleEndian>(&mut values)?;

        Ok(Self::new(Method::new(name, version), Embedding { values }))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(16 + self.method_name().len() + self.size());
        self.save(&mut buf)?;
        Ok(buf)
    }

    /// Decode a buffer holding exactly one template.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(bytes);
        let template = Self::load(&mut cursor)?;
        if (cursor.position() as usize) != bytes.len() {
            return Err(Error::CorruptData("trailing bytes after template".into()));
        }
        Ok(template)
    }

    /// Drop this handle. Other clones stay valid.
    pub fn release(self) {}
}

/// Map an unexpected end of stream to `CorruptData`; other I/O errors pass through.
pub(crate) fn truncation_is_corruption(err: Error) -> Error {
    match err {
        Error::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
            Error::CorruptData("truncated data".into())
        }
        other => other,
    }
}

/// Read every template from a file of back-to-back encoded templates.
pub fn load_templates_file(path: &Path) -> Result<Vec<ContextTemplate>> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut templates = Vec::new();
    while !reader.fill_buf()?.is_empty() {
        templates.push(ContextTemplate::load(&mut reader)?);
    }
    tracing::debug!(path = %path.display(), count = templates.len(), "templates loaded");
    Ok(templates)
}
