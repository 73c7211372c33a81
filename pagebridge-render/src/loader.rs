//! Turns `loadDataUri` / `loadUrl` requests into an open document.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pagebridge_core::{DocumentBackend, DocumentProvider, DocumentSource};
use tracing::{debug, info, instrument};
use url::Url;

pub const PDF_DATA_URI_PREFIX: &str = "data:application/pdf;base64,";

const FETCH_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_DOCUMENT_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    #[error("Invalid PDF data URI")]
    InvalidDataUri,
    #[error("failed to decode PDF data: {0}")]
    Decode(String),
    #[error("invalid document URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },
    #[error("failed to open document: {0}")]
    Open(String),
    #[error("timeout")]
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadRequest {
    DataUri(String),
    Url(String),
}

impl LoadRequest {
    pub fn describe(&self) -> String {
        match self {
            LoadRequest::DataUri(uri) => format!("data URI ({} bytes)", uri.len()),
            LoadRequest::Url(url) => url.clone(),
        }
    }
}

/// Where a `loadUrl` target lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlTarget {
    File(PathBuf),
    Remote(Url),
}

pub fn decode_data_uri(data_uri: &str) -> Result<Vec<u8>, LoadError> {
    let payload = data_uri
        .strip_prefix(PDF_DATA_URI_PREFIX)
        .ok_or(LoadError::InvalidDataUri)?;
    let compact: String = payload
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    BASE64
        .decode(compact.as_bytes())
        .map_err(|err| LoadError::Decode(err.to_string()))
}

/// `file://` URLs and bare paths resolve to disk, `http(s)://` to a fetch.
pub fn resolve_url(raw: &str) -> Result<UrlTarget, LoadError> {
    let invalid = |reason: String| LoadError::InvalidUrl {
        url: raw.to_owned(),
        reason,
    };
    match Url::parse(raw) {
        Ok(url) => match url.scheme() {
            "file" => url
                .to_file_path()
                .map(UrlTarget::File)
                .map_err(|_| invalid("not a local file path".into())),
            "http" | "https" => Ok(UrlTarget::Remote(url)),
            other => Err(invalid(format!("unsupported scheme `{other}`"))),
        },
        Err(url::ParseError::RelativeUrlWithoutBase) if !raw.trim().is_empty() => {
            Ok(UrlTarget::File(PathBuf::from(raw)))
        }
        Err(err) => Err(invalid(err.to_string())),
    }
}

/// Blocking HTTP GET of a whole document.
pub fn fetch(url: &Url) -> Result<Vec<u8>, LoadError> {
    let failed = |reason: String| LoadError::Fetch {
        url: url.to_string(),
        reason,
    };
    let agent = ureq::AgentBuilder::new()
        .timeout_read(FETCH_TIMEOUT)
        .timeout_write(FETCH_TIMEOUT)
        .build();

    let response = match agent.get(url.as_str()).call() {
        Ok(response) => response,
        Err(ureq::Error::Status(code, _)) => {
            return Err(failed(format!("HTTP status {code}")));
        }
        Err(err) => return Err(failed(err.to_string())),
    };

    read_limited(response.into_reader(), MAX_DOCUMENT_BYTES).map_err(failed)
}

/// Reads a whole body, failing instead of truncating past `limit` bytes.
fn read_limited(reader: impl Read, limit: u64) -> Result<Vec<u8>, String> {
    let mut data = Vec::new();
    reader
        .take(limit.saturating_add(1))
        .read_to_end(&mut data)
        .map_err(|err| err.to_string())?;
    if data.len() as u64 > limit {
        return Err(format!("document exceeds {}", describe_size(limit)));
    }
    Ok(data)
}

fn describe_size(bytes: u64) -> String {
    const MIB: u64 = 1024 * 1024;
    if bytes >= MIB && bytes % MIB == 0 {
        format!("{} MiB", bytes / MIB)
    } else {
        format!("{bytes} bytes")
    }
}

async fn source_for(request: LoadRequest) -> Result<DocumentSource, LoadError> {
    match request {
        LoadRequest::DataUri(uri) => Ok(DocumentSource::Bytes {
            label: "data-uri".into(),
            data: decode_data_uri(&uri)?,
        }),
        LoadRequest::Url(raw) => match resolve_url(&raw)? {
            UrlTarget::File(path) => Ok(DocumentSource::Path(path)),
            UrlTarget::Remote(url) => {
                debug!(%url, "fetching document");
                let label = url.to_string();
                let data = tokio::task::spawn_blocking(move || fetch(&url))
                    .await
                    .map_err(|err| LoadError::Fetch {
                        url: label.clone(),
                        reason: err.to_string(),
                    })??;
                Ok(DocumentSource::Bytes { label, data })
            }
        },
    }
}

/// Resolves, fetches and opens a document. Not bounded in time; callers
/// wrap it with their load timeout.
#[instrument(skip(provider, request), fields(source = %request.describe()))]
pub async fn load<P>(provider: &P, request: LoadRequest) -> Result<Arc<dyn DocumentBackend>, LoadError>
where
    P: DocumentProvider + ?Sized,
{
    let source = source_for(request).await?;
    let label = source.label();
    let backend = provider
        .open(source)
        .await
        .map_err(|err| LoadError::Open(format!("{err:#}")))?;
    info!(%label, pages = backend.info().page_count, "document opened");
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProvider;
    use std::io::Cursor;

    #[test]
    fn oversized_bodies_fail_instead_of_truncating() {
        let body = b"%PDF-1.7 0123456789".to_vec();
        let exact = body.len() as u64;

        assert_eq!(read_limited(Cursor::new(body.clone()), exact).unwrap(), body);
        assert_eq!(
            read_limited(Cursor::new(body.clone()), exact - 1).unwrap_err(),
            format!("document exceeds {} bytes", exact - 1)
        );
        assert_eq!(
            read_limited(Cursor::new(Vec::new()), MAX_DOCUMENT_BYTES).unwrap(),
            Vec::<u8>::new()
        );
        assert_eq!(describe_size(MAX_DOCUMENT_BYTES), "256 MiB");
    }

    #[test]
    fn decodes_pdf_data_uri_tolerating_whitespace() {
        let encoded = BASE64.encode(b"%PDF-1.4 body");
        let (head, tail) = encoded.split_at(6);
        let uri = format!("{PDF_DATA_URI_PREFIX}{head}\n  {tail}");
        assert_eq!(decode_data_uri(&uri).unwrap(), b"%PDF-1.4 body");
    }

    #[test]
    fn rejects_other_data_uris() {
        let err = decode_data_uri("data:text/plain;base64,aGVsbG8=").unwrap_err();
        assert!(matches!(err, LoadError::InvalidDataUri));
        assert_eq!(err.to_string(), "Invalid PDF data URI");

        assert!(matches!(
            decode_data_uri(&format!("{PDF_DATA_URI_PREFIX}@@not-base64@@")),
            Err(LoadError::Decode(_))
        ));
    }

    #[test]
    fn resolves_url_kinds() {
        assert_eq!(
            resolve_url("file:///tmp/a.pdf").unwrap(),
            UrlTarget::File(PathBuf::from("/tmp/a.pdf"))
        );
        assert_eq!(
            resolve_url("docs/a.pdf").unwrap(),
            UrlTarget::File(PathBuf::from("docs/a.pdf"))
        );
        assert!(matches!(
            resolve_url("https://example.com/a.pdf").unwrap(),
            UrlTarget::Remote(url) if url.host_str() == Some("example.com")
        ));
        assert!(matches!(
            resolve_url("ftp://example.com/a.pdf"),
            Err(LoadError::InvalidUrl { .. })
        ));
        assert!(matches!(resolve_url(""), Err(LoadError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn load_opens_decoded_bytes_through_provider() {
        let provider = FakeProvider::new(3);
        let uri = format!("{PDF_DATA_URI_PREFIX}{}", BASE64.encode(b"%PDF"));
        let backend = load(&provider, LoadRequest::DataUri(uri)).await.unwrap();
        assert_eq!(backend.info().page_count, 3);
        assert_eq!(*provider.state.opened.lock(), vec!["data-uri".to_string()]);
    }

    #[tokio::test]
    async fn load_reports_invalid_prefix_before_opening() {
        let provider = FakeProvider::new(3);
        let result = load(&provider, LoadRequest::DataUri("data:,nope".into())).await;
        assert!(matches!(result, Err(LoadError::InvalidDataUri)));
        assert!(provider.state.opened.lock().is_empty());
    }
}
