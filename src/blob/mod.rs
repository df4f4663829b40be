//! Binary payloads for text nodes.
//!
//! A binary text node holds a [`BinaryPayload`]: a content identifier, a
//! reference to the bytes and a flag asking the sink to transmit the data
//! out of band. The bytes live behind a [`Blob`], which is shared by `Rc`
//! so that clones of a tree can point at the same data. A blob may also be
//! resolved lazily through a [`BlobProvider`] keyed by content id.
//!
//! Payloads are written as base64 in bounded chunks, so no full encoded copy
//! of the data is ever held in memory.

use std::fmt;
use std::io::{self, Read};
use std::rc::Rc;

use base64::Engine;

/// Raw bytes per base64 chunk. A multiple of 3 so chunks carry no padding.
const CHUNK_BYTES: usize = 3 * 1024;

/// A source of binary data that can be read any number of times.
pub trait Blob: fmt::Debug {
    /// Opens a fresh reader over the data.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the data can no longer be read.
    fn open(&self) -> io::Result<Box<dyn Read + '_>>;

    /// Size in bytes, if known up front.
    fn size(&self) -> Option<u64> {
        None
    }
}

/// A blob held entirely in memory.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemoryBlob {
    data: Vec<u8>,
}

impl MemoryBlob {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }

    /// Returns the bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Blob for MemoryBlob {
    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(self.data.as_slice()))
    }

    fn size(&self) -> Option<u64> {
        u64::try_from(self.data.len()).ok()
    }
}

/// Resolves content ids to blobs, typically backed by MIME attachments.
pub trait BlobProvider: fmt::Debug {
    /// Looks up the blob for `content_id`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the id is unknown or the part unreadable.
    fn get_blob(&self, content_id: &str) -> io::Result<Rc<dyn Blob>>;
}

/// A handle to the bytes of a binary payload.
#[derive(Debug, Clone)]
pub enum BlobRef {
    /// The blob is at hand.
    Resolved(Rc<dyn Blob>),
    /// The blob is fetched from the provider on first use.
    Lazy {
        provider: Rc<dyn BlobProvider>,
        content_id: String,
    },
}

impl BlobRef {
    /// Returns the blob, asking the provider if needed.
    ///
    /// # Errors
    ///
    /// Propagates the provider's error.
    pub fn resolve(&self) -> io::Result<Rc<dyn Blob>> {
        match self {
            Self::Resolved(blob) => Ok(Rc::clone(blob)),
            Self::Lazy {
                provider,
                content_id,
            } => provider.get_blob(content_id),
        }
    }
}

/// The payload of a binary text node.
#[derive(Debug, Clone)]
pub struct BinaryPayload {
    /// Identifier used when the data is transmitted out of band.
    pub content_id: Option<String>,
    /// The bytes.
    pub blob: BlobRef,
    /// Whether the sink should transmit the data out of band when it can.
    pub optimize: bool,
}

impl BinaryPayload {
    /// Creates a payload over an already available blob.
    pub fn new(blob: Rc<dyn Blob>) -> Self {
        Self {
            content_id: None,
            blob: BlobRef::Resolved(blob),
            optimize: false,
        }
    }

    /// Creates a payload whose blob is resolved through `provider` on demand.
    pub fn from_provider(provider: Rc<dyn BlobProvider>, content_id: impl Into<String>) -> Self {
        let content_id = content_id.into();
        Self {
            content_id: Some(content_id.clone()),
            blob: BlobRef::Lazy {
                provider,
                content_id,
            },
            optimize: true,
        }
    }

    #[must_use]
    pub fn with_content_id(mut self, content_id: impl Into<String>) -> Self {
        self.content_id = Some(content_id.into());
        self
    }

    #[must_use]
    pub fn optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    /// Returns `true` if both payloads refer to the same underlying data
    /// without having copied it.
    #[must_use]
    pub fn shares_blob(&self, other: &BinaryPayload) -> bool {
        match (&self.blob, &other.blob) {
            (BlobRef::Resolved(a), BlobRef::Resolved(b)) => {
                std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
            }
            (
                BlobRef::Lazy {
                    provider: pa,
                    content_id: ca,
                },
                BlobRef::Lazy {
                    provider: pb,
                    content_id: cb,
                },
            ) => std::ptr::addr_eq(Rc::as_ptr(pa), Rc::as_ptr(pb)) && ca == cb,
            _ => false,
        }
    }

    /// Reads the data into a new in-memory blob.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the blob cannot be resolved or read.
    pub fn materialize(&self) -> io::Result<BinaryPayload> {
        let blob = self.blob.resolve()?;
        let mut data = Vec::new();
        blob.open()?.read_to_end(&mut data)?;
        Ok(BinaryPayload {
            content_id: self.content_id.clone(),
            blob: BlobRef::Resolved(Rc::new(MemoryBlob::new(data))),
            optimize: self.optimize,
        })
    }

    /// Streams the data as base64, passing each encoded chunk to `write`.
    ///
    /// # Errors
    ///
    /// Returns the first error from reading the blob or from `write`.
    pub fn write_base64(&self, write: &mut dyn FnMut(&str) -> io::Result<()>) -> io::Result<()> {
        let blob = self.blob.resolve()?;
        let mut reader = blob.open()?;
        let mut raw = vec![0u8; CHUNK_BYTES];
        let mut encoded = String::with_capacity(CHUNK_BYTES / 3 * 4);
        loop {
            let filled = fill_chunk(&mut reader, &mut raw)?;
            if filled == 0 {
                break;
            }
            encoded.clear();
            base64::engine::general_purpose::STANDARD.encode_string(&raw[..filled], &mut encoded);
            write(&encoded)?;
            if filled < raw.len() {
                break;
            }
        }
        Ok(())
    }

    /// Returns the whole payload as a base64 string.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the blob cannot be read.
    pub fn to_base64(&self) -> io::Result<String> {
        let mut out = String::new();
        self.write_base64(&mut |chunk| {
            out.push_str(chunk);
            Ok(())
        })?;
        Ok(out)
    }
}

/// Payloads are equal when they carry the same id and flag and share data.
impl PartialEq for BinaryPayload {
    fn eq(&self, other: &Self) -> bool {
        self.content_id == other.content_id
            && self.optimize == other.optimize
            && self.shares_blob(other)
    }
}

/// Reads until `buf` is full or the reader is exhausted.
fn fill_chunk(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::HashMap;

    #[derive(Debug, Default)]
    struct MapProvider {
        blobs: HashMap<String, Rc<dyn Blob>>,
        lookups: Cell<usize>,
    }

    impl BlobProvider for MapProvider {
        fn get_blob(&self, content_id: &str) -> io::Result<Rc<dyn Blob>> {
            self.lookups.set(self.lookups.get() + 1);
            self.blobs
                .get(content_id)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, content_id.to_string()))
        }
    }

    #[test]
    fn test_base64_small_payload() {
        let payload = BinaryPayload::new(Rc::new(MemoryBlob::new(b"hello".to_vec())));
        assert_eq!(payload.to_base64().unwrap(), "aGVsbG8=");
    }

    #[test]
    fn test_base64_is_chunked() {
        let data = vec![7u8; CHUNK_BYTES * 2 + 5];
        let payload = BinaryPayload::new(Rc::new(MemoryBlob::new(data.clone())));
        let mut chunks = 0;
        let mut joined = String::new();
        payload
            .write_base64(&mut |chunk| {
                chunks += 1;
                joined.push_str(chunk);
                Ok(())
            })
            .unwrap();
        assert_eq!(chunks, 3);
        assert_eq!(
            joined,
            base64::engine::general_purpose::STANDARD.encode(&data)
        );
    }

    #[test]
    fn test_lazy_blob_resolves_on_use() {
        let mut provider = MapProvider::default();
        provider
            .blobs
            .insert("cid:1".to_string(), Rc::new(MemoryBlob::new(b"abc".to_vec())));
        let provider = Rc::new(provider);
        let payload = BinaryPayload::from_provider(provider.clone(), "cid:1");
        assert_eq!(provider.lookups.get(), 0);
        assert_eq!(payload.to_base64().unwrap(), "YWJj");
        assert_eq!(provider.lookups.get(), 1);
    }

    #[test]
    fn test_unknown_content_id_is_io_error() {
        let provider: Rc<dyn BlobProvider> = Rc::new(MapProvider::default());
        let payload = BinaryPayload::from_provider(provider, "cid:missing");
        assert_eq!(
            payload.to_base64().unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[test]
    fn test_clone_shares_and_materialize_copies() {
        let payload = BinaryPayload::new(Rc::new(MemoryBlob::new(b"xyz".to_vec())));
        let shared = payload.clone();
        assert!(payload.shares_blob(&shared));
        let copied = payload.materialize().unwrap();
        assert!(!payload.shares_blob(&copied));
        assert_eq!(copied.to_base64().unwrap(), payload.to_base64().unwrap());
    }
}
