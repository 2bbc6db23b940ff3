//! reqwest-backed [`RequestExecutor`] for S3/COS-style HTTP endpoints.
//!
//! Requests are addressed path-style relative to a base URL that already names
//! the bucket, e.g. `https://bucket.cos.example.com/` or
//! `http://127.0.0.1:9000/bucket/`. Authentication is out of scope; callers
//! needing signatures supply their own executor or default headers.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, RANGE};
use reqwest::{Client, Method};
use tracing::{debug, instrument};
use url::Url;

use super::backend::{
    Body, ObjectRequest, ObjectResponse, Operation, PartResult, RequestExecutor,
};
use super::constants::{
    CONNECT_TIMEOUT_SECS, COPY_SOURCE_HEADER, READ_TIMEOUT_SECS, STORAGE_CLASS_HEADER,
};
use super::TransferError;

/// Project URL for User-Agent identification.
const PROJECT_UA_URL: &str = "https://github.com/fierce/objstore";

/// Default User-Agent for backend requests.
#[must_use]
pub fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("objstore/{version} (+{PROJECT_UA_URL})")
}

/// HTTP executor speaking the multipart-upload REST dialect.
///
/// Created once per endpoint and reused so connections are pooled.
///
/// # Example
///
/// ```no_run
/// use objstore_core::storage::HttpExecutor;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let executor = HttpExecutor::new("http://127.0.0.1:9000/bucket/")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: Client,
    base: Url,
}

impl HttpExecutor {
    /// Creates an executor with default timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidRequest`] when the endpoint is not a
    /// valid base URL, or a transport error if the HTTP client cannot be
    /// built.
    pub fn new(endpoint: &str) -> Result<Self, TransferError> {
        Self::with_options(
            endpoint,
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(READ_TIMEOUT_SECS),
            HeaderMap::new(),
        )
    }

    /// Creates an executor with explicit timeouts and headers sent on every
    /// request.
    ///
    /// # Errors
    ///
    /// See [`HttpExecutor::new`].
    #[instrument(level = "debug", skip(default_headers))]
    pub fn with_options(
        endpoint: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
        default_headers: HeaderMap,
    ) -> Result<Self, TransferError> {
        let base = parse_base_url(endpoint)?;
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .user_agent(default_user_agent())
            .default_headers(default_headers)
            .build()
            .map_err(|e| TransferError::transport("BuildClient", endpoint, e))?;
        debug!(base = %base, "http executor ready");
        Ok(Self { client, base })
    }

    /// Base URL requests are resolved against.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn object_url(&self, key: &str) -> Result<Url, TransferError> {
        let encoded = encode_key(key);
        self.base
            .join(&encoded)
            .map_err(|e| TransferError::invalid_request(key, format!("bad object path: {e}")))
    }

    fn build(&self, request: ObjectRequest) -> Result<reqwest::RequestBuilder, TransferError> {
        let ObjectRequest {
            operation,
            key,
            body,
        } = request;
        let mut url = self.object_url(&key)?;

        let (method, body) = match operation {
            Operation::HeadObject | Operation::CheckObjectExist => (Method::HEAD, Body::Empty),
            Operation::GetObject { .. } => (Method::GET, Body::Empty),
            Operation::PutObject { .. } | Operation::CopyObject { .. } => (Method::PUT, body),
            Operation::InitiateMultipartUpload { .. } => {
                url.set_query(Some("uploads"));
                (Method::POST, Body::Empty)
            }
            Operation::UploadPart {
                ref upload_id,
                part_number,
            } => {
                url.query_pairs_mut()
                    .append_pair("partNumber", &part_number.to_string())
                    .append_pair("uploadId", upload_id);
                (Method::PUT, body)
            }
            Operation::CompleteMultipartUpload {
                ref upload_id,
                ref parts,
            } => {
                url.query_pairs_mut().append_pair("uploadId", upload_id);
                (Method::POST, Body::Bytes(complete_body(parts).into()))
            }
            Operation::AbortMultipartUpload { ref upload_id } => {
                url.query_pairs_mut().append_pair("uploadId", upload_id);
                (Method::DELETE, Body::Empty)
            }
            Operation::DeleteObject => (Method::DELETE, Body::Empty),
        };

        let mut builder = self.client.request(method, url);
        match &operation {
            Operation::GetObject { range: Some(range) } => {
                builder = builder.header(RANGE, range.header_value());
            }
            Operation::PutObject {
                storage_class: Some(class),
            }
            | Operation::InitiateMultipartUpload {
                storage_class: Some(class),
            } => {
                builder = builder.header(STORAGE_CLASS_HEADER, class);
            }
            Operation::CopyObject { source_key } => {
                let source = self.object_url(source_key)?;
                let host = source.host_str().unwrap_or_default();
                builder = builder.header(COPY_SOURCE_HEADER, format!("{host}{}", source.path()));
            }
            Operation::CompleteMultipartUpload { .. } => {
                builder = builder.header(CONTENT_TYPE, "application/xml");
            }
            _ => {}
        }

        let builder = match body {
            Body::Empty => builder,
            Body::Bytes(bytes) => builder.body(bytes),
            Body::Stream { stream, length } => builder
                .header(CONTENT_LENGTH, length)
                .body(reqwest::Body::wrap_stream(stream)),
        };
        Ok(builder)
    }
}

#[async_trait]
impl RequestExecutor for HttpExecutor {
    #[instrument(level = "trace", skip(self, request), fields(operation = request.operation.name(), key = %request.key))]
    async fn execute(&self, request: ObjectRequest) -> Result<ObjectResponse, TransferError> {
        let operation = request.operation.name();
        let is_head = matches!(
            request.operation,
            Operation::HeadObject | Operation::CheckObjectExist
        );
        let key = request.key.clone();

        let response = self
            .build(request)?
            .send()
            .await
            .map_err(|e| TransferError::transport(operation, key.as_str(), e))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = if is_head {
            Body::Empty
        } else {
            let length = response.content_length().unwrap_or(0);
            let stream_key = key.clone();
            let stream = response
                .bytes_stream()
                .map_err(move |e| TransferError::transport(operation, stream_key.as_str(), e))
                .boxed();
            Body::stream(stream, length)
        };

        Ok(ObjectResponse {
            status,
            headers,
            body,
        })
    }
}

fn parse_base_url(endpoint: &str) -> Result<Url, TransferError> {
    let mut base = Url::parse(endpoint)
        .map_err(|e| TransferError::invalid_request(endpoint, format!("invalid endpoint: {e}")))?;
    if base.cannot_be_a_base() {
        return Err(TransferError::invalid_request(
            endpoint,
            "endpoint cannot be used as a base URL",
        ));
    }
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base)
}

/// Percent-encodes each key segment, keeping `/` separators.
fn encode_key(key: &str) -> String {
    key.trim_start_matches('/')
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn complete_body(parts: &[PartResult]) -> String {
    let mut xml = String::from("<CompleteMultipartUpload>");
    for part in parts {
        xml.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>\"{}\"</ETag></Part>",
            part.part_number,
            escape_xml(&part.etag)
        ));
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
