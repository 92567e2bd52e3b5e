//! FastCGI responder client
//!
//! One connection per request: BEGIN_REQUEST, PARAMS stream, STDIN stream, then
//! records are read back until END_REQUEST. STDOUT is split into a header block
//! and a body; the body is handed to hyper as a stream so every chunk a script
//! writes reaches the client as soon as it arrives.

use crate::error::{GatewayErrorCode, ResponseBody};
use futures::channel::mpsc;
use futures::SinkExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, LOCATION, SET_COOKIE};
use hyper::{Method, Response, StatusCode};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

pub const FCGI_VERSION_1: u8 = 1;

/// Size of a record header on the wire
pub const HEADER_LEN: usize = 8;

/// Largest content a single record can carry
pub const MAX_CONTENT_LEN: usize = 65_535;

pub const ROLE_RESPONDER: u16 = 1;

/// Every request uses its own connection, so the id is constant
const REQUEST_ID: u16 = 1;

/// Body chunks buffered between the record reader and hyper
const BODY_CHANNEL_CAPACITY: usize = 8;

/// Largest header block accepted before the blank line
pub const MAX_HEADER_BLOCK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

impl RecordType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            11 => RecordType::UnknownType,
            _ => return None,
        })
    }
}

#[derive(Debug, Error)]
pub enum FastCgiError {
    #[error("failed to connect to FastCGI worker at {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("timed out connecting to FastCGI worker at {0}")]
    ConnectTimeout(String),

    #[error("FastCGI worker sent nothing for {0:?}")]
    ReadTimeout(Duration),

    #[error("FastCGI worker closed the connection mid-response")]
    UnexpectedEof,

    #[error("FastCGI I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("FastCGI protocol error: {0}")]
    Protocol(String),
}

impl FastCgiError {
    pub fn gateway_code(&self) -> GatewayErrorCode {
        match self {
            FastCgiError::Connect { .. } | FastCgiError::ConnectTimeout(_) => {
                GatewayErrorCode::ServiceUnavailable
            }
            FastCgiError::ReadTimeout(_) => GatewayErrorCode::GatewayTimeout,
            FastCgiError::UnexpectedEof | FastCgiError::Io(_) | FastCgiError::Protocol(_) => {
                GatewayErrorCode::BadGateway
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u8,
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl RecordHeader {
    pub fn new(record_type: RecordType, request_id: u16, content_length: usize) -> Self {
        Self {
            version: FCGI_VERSION_1,
            record_type: record_type as u8,
            request_id,
            content_length: content_length as u16,
            padding_length: padding_for(content_length),
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let id = self.request_id.to_be_bytes();
        let len = self.content_length.to_be_bytes();
        [
            self.version,
            self.record_type,
            id[0],
            id[1],
            len[0],
            len[1],
            self.padding_length,
            0,
        ]
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            version: buf[0],
            record_type: buf[1],
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
        }
    }
}

/// Padding that brings `len` up to a multiple of 8
pub fn padding_for(len: usize) -> u8 {
    ((8 - len % 8) % 8) as u8
}

/// Append one record. `content` must fit in [`MAX_CONTENT_LEN`].
pub fn encode_record(buf: &mut Vec<u8>, record_type: RecordType, request_id: u16, content: &[u8]) {
    debug_assert!(content.len() <= MAX_CONTENT_LEN);
    let header = RecordHeader::new(record_type, request_id, content.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(content);
    buf.resize(buf.len() + header.padding_length as usize, 0);
}

/// Append a stream: content split into maximal records, then an empty record
pub fn encode_stream(buf: &mut Vec<u8>, record_type: RecordType, request_id: u16, data: &[u8]) {
    for chunk in data.chunks(MAX_CONTENT_LEN) {
        encode_record(buf, record_type, request_id, chunk);
    }
    encode_record(buf, record_type, request_id, &[]);
}

fn encode_length(buf: &mut Vec<u8>, len: usize) {
    if len < 128 {
        buf.push(len as u8);
    } else {
        buf.extend_from_slice(&((len as u32) | 0x8000_0000).to_be_bytes());
    }
}

/// Name-value pairs in the PARAMS wire format
pub fn encode_params(params: &BTreeMap<String, String>) -> Vec<u8> {
    let mut buf = Vec::new();
    for (name, value) in params {
        encode_length(&mut buf, name.len());
        encode_length(&mut buf, value.len());
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(value.as_bytes());
    }
    buf
}

/// Everything the client writes for one request
pub fn encode_request(request_id: u16, params: &BTreeMap<String, String>, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN * 6 + body.len());

    let role = ROLE_RESPONDER.to_be_bytes();
    // role, flags (no keep-alive), reserved
    let begin = [role[0], role[1], 0, 0, 0, 0, 0, 0];
    encode_record(&mut buf, RecordType::BeginRequest, request_id, &begin);

    encode_stream(&mut buf, RecordType::Params, request_id, &encode_params(params));
    encode_stream(&mut buf, RecordType::Stdin, request_id, body);

    buf
}

/// `HTTP_` variable name for an inbound header
pub fn header_param_name(name: &str) -> String {
    format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"))
}

/// A script invocation as seen by the worker
#[derive(Debug, Clone)]
pub struct ScriptRequest {
    pub method: Method,
    /// Absolute path of the script
    pub script_filename: PathBuf,
    /// Script path below the document root, e.g. `/index.php`
    pub script_name: String,
    pub document_root: PathBuf,
    /// URI the client asked for, kept when routed to a root file
    pub request_uri: String,
    /// Path the client asked for
    pub path_info: String,
    pub query_string: String,
    pub server_name: String,
    pub client_ip: String,
    pub is_tls: bool,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ScriptRequest {
    pub fn params(&self) -> BTreeMap<String, String> {
        let script_filename = self.script_filename.display().to_string();
        let content_type = self
            .headers
            .get(hyper::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let mut params = BTreeMap::new();
        params.insert("REQUEST_METHOD".into(), self.method.to_string());
        params.insert("REQUEST_URI".into(), self.request_uri.clone());
        params.insert("QUERY_STRING".into(), self.query_string.clone());
        params.insert("CONTENT_TYPE".into(), content_type);
        params.insert("CONTENT_LENGTH".into(), self.body.len().to_string());
        params.insert("SCRIPT_FILENAME".into(), script_filename.clone());
        params.insert("SCRIPT_NAME".into(), self.script_name.clone());
        params.insert("DOCUMENT_ROOT".into(), self.document_root.display().to_string());
        params.insert("SERVER_NAME".into(), self.server_name.clone());
        params.insert("HTTP_HOST".into(), self.server_name.clone());
        params.insert(
            "SERVER_PORT".into(),
            if self.is_tls { "443" } else { "80" }.to_string(),
        );
        params.insert("SERVER_PROTOCOL".into(), "HTTP/1.1".into());
        params.insert("GATEWAY_INTERFACE".into(), "CGI/1.1".into());
        params.insert("REDIRECT_STATUS".into(), "200".into());
        params.insert("REMOTE_ADDR".into(), self.client_ip.clone());
        params.insert("REMOTE_HOST".into(), self.client_ip.clone());
        params.insert("PATH_INFO".into(), self.path_info.clone());
        params.insert("PATH_TRANSLATED".into(), script_filename);
        if self.is_tls {
            params.insert("HTTPS".into(), "on".into());
        }

        for name in self.headers.keys() {
            if let Some(value) = self.headers.get(name).and_then(|v| v.to_str().ok()) {
                params.insert(header_param_name(name.as_str()), value.to_string());
            }
        }

        params
    }
}

#[derive(Debug, Clone)]
pub struct Record {
    pub header: RecordHeader,
    pub content: Bytes,
}

impl Record {
    pub fn kind(&self) -> Option<RecordType> {
        RecordType::from_u8(self.header.record_type)
    }
}

/// Reads records, giving up when a single record takes longer than `read_timeout`.
///
/// The timeout is per record, so a script that keeps trickling output can run
/// well past `read_timeout` in total.
pub struct RecordReader<S> {
    stream: S,
    read_timeout: Duration,
}

impl<S: AsyncRead + Unpin> RecordReader<S> {
    pub fn new(stream: S, read_timeout: Duration) -> Self {
        Self {
            stream,
            read_timeout,
        }
    }

    pub async fn next_record(&mut self) -> Result<Record, FastCgiError> {
        match tokio::time::timeout(self.read_timeout, self.read_record()).await {
            Ok(result) => result,
            Err(_) => Err(FastCgiError::ReadTimeout(self.read_timeout)),
        }
    }

    async fn read_record(&mut self) -> Result<Record, FastCgiError> {
        let mut header_buf = [0u8; HEADER_LEN];
        read_exact_or_eof(&mut self.stream, &mut header_buf).await?;
        let header = RecordHeader::decode(&header_buf);

        if header.version != FCGI_VERSION_1 {
            return Err(FastCgiError::Protocol(format!(
                "unsupported record version {}",
                header.version
            )));
        }

        let mut content = vec![0u8; header.content_length as usize];
        read_exact_or_eof(&mut self.stream, &mut content).await?;

        let mut padding = [0u8; 255];
        read_exact_or_eof(
            &mut self.stream,
            &mut padding[..header.padding_length as usize],
        )
        .await?;

        Ok(Record {
            header,
            content: Bytes::from(content),
        })
    }
}

async fn read_exact_or_eof<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut [u8]) -> Result<(), FastCgiError> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(FastCgiError::UnexpectedEof),
        Err(e) => Err(FastCgiError::Io(e)),
    }
}

/// Status and headers emitted by a script
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl Default for ResponseHead {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
        }
    }
}

impl ResponseHead {
    pub fn into_response(self, body: ResponseBody) -> Response<ResponseBody> {
        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Position and length of the blank line ending the header block
pub fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, 4));
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Parse a CGI header block.
///
/// `Set-Cookie` lines accumulate, other headers replace earlier values.
/// `Location` implies 302 unless a `Status` line names the code.
pub fn parse_headers(block: &[u8]) -> ResponseHead {
    let text = String::from_utf8_lossy(block);
    let mut head = ResponseHead::default();
    let mut explicit_status = None;
    let mut redirect = false;

    for line in text.lines() {
        let Some((name, value)) = line.trim().split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("status") {
            explicit_status = value
                .split_whitespace()
                .next()
                .and_then(|code| code.parse::<u16>().ok())
                .and_then(|code| StatusCode::from_u16(code).ok());
            continue;
        }

        let (Ok(header_name), Ok(header_value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            debug!(line, "Ignoring malformed script header");
            continue;
        };

        if header_name == SET_COOKIE {
            head.headers.append(header_name, header_value);
        } else {
            if header_name == LOCATION {
                redirect = true;
            }
            head.headers.insert(header_name, header_value);
        }
    }

    head.status = match (explicit_status, redirect) {
        (Some(status), _) => status,
        (None, true) => StatusCode::FOUND,
        (None, false) => StatusCode::OK,
    };
    head
}

fn log_stderr(script: &str, stderr: &[u8]) {
    if !stderr.is_empty() {
        warn!(script, stderr = %String::from_utf8_lossy(stderr).trim_end(), "Script wrote to stderr");
    }
}

/// Send a request over an open connection and read the response head.
///
/// The body keeps streaming from a background task after this returns.
pub async fn exchange<S>(
    mut stream: S,
    request: &ScriptRequest,
    read_timeout: Duration,
) -> Result<Response<ResponseBody>, FastCgiError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let payload = encode_request(REQUEST_ID, &request.params(), &request.body);
    stream.write_all(&payload).await?;
    stream.flush().await?;

    let script = request.script_name.clone();
    let mut reader = RecordReader::new(stream, read_timeout);
    let mut buffered = Vec::new();
    let mut stderr = Vec::new();

    loop {
        let record = reader.next_record().await?;
        match record.kind() {
            Some(RecordType::Stdout) => {
                // A separator may straddle two records
                let scan_from = buffered.len().saturating_sub(3);
                buffered.extend_from_slice(&record.content);
                let found = find_header_end(&buffered[scan_from..])
                    .map(|(end, separator)| (scan_from + end, separator));
                if let Some((end, separator)) = found {
                    let head = parse_headers(&buffered[..end]);
                    let rest = Bytes::copy_from_slice(&buffered[end + separator..]);
                    debug!(script, status = %head.status, "Script headers received");
                    return Ok(stream_body(head, rest, reader, stderr, script));
                }
                if buffered.len() > MAX_HEADER_BLOCK {
                    log_stderr(&script, &stderr);
                    return Err(FastCgiError::Protocol(format!(
                        "no end of header block within {} bytes",
                        MAX_HEADER_BLOCK
                    )));
                }
            }
            Some(RecordType::Stderr) => stderr.extend_from_slice(&record.content),
            Some(RecordType::EndRequest) => {
                log_stderr(&script, &stderr);
                debug!(script, "Script ended without a header block");
                let body = crate::error::full_body(buffered);
                return Ok(ResponseHead::default().into_response(body));
            }
            _ => {}
        }
    }
}

fn stream_body<S>(
    head: ResponseHead,
    first_chunk: Bytes,
    mut reader: RecordReader<S>,
    mut stderr: Vec<u8>,
    script: String,
) -> Response<ResponseBody>
where
    S: AsyncRead + Unpin + Send + 'static,
{
    let (mut tx, rx) = mpsc::channel::<Result<Frame<Bytes>, std::io::Error>>(BODY_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        // The worker is drained to END_REQUEST even if the client disconnects
        let mut client_gone = false;
        if !first_chunk.is_empty() {
            client_gone = tx.send(Ok(Frame::data(first_chunk))).await.is_err();
        }

        loop {
            match reader.next_record().await {
                Ok(record) => match record.kind() {
                    Some(RecordType::Stdout) if !record.content.is_empty() => {
                        if !client_gone && tx.send(Ok(Frame::data(record.content))).await.is_err() {
                            debug!(script, "Client went away, draining script output");
                            client_gone = true;
                        }
                    }
                    Some(RecordType::Stderr) => stderr.extend_from_slice(&record.content),
                    Some(RecordType::EndRequest) => break,
                    _ => {}
                },
                Err(e) => {
                    error!(script, error = %e, "FastCGI response aborted");
                    let _ = tx.send(Err(std::io::Error::other(e))).await;
                    break;
                }
            }
        }

        log_stderr(&script, &stderr);
    });

    head.into_response(StreamBody::new(rx).boxed_unsync())
}

/// Connects to workers and runs scripts
#[derive(Debug, Clone)]
pub struct FastCgiClient {
    host: String,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl FastCgiClient {
    pub fn new(host: impl Into<String>, connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            connect_timeout,
            read_timeout,
        }
    }

    pub fn from_config(config: &crate::config::FastCgiConfig) -> Self {
        Self::new(
            config.host.clone(),
            config.connect_timeout(),
            config.read_timeout(),
        )
    }

    /// Run `request` on the worker listening on `port`
    pub async fn execute(
        &self,
        port: u16,
        request: &ScriptRequest,
    ) -> Result<Response<ResponseBody>, FastCgiError> {
        let addr = format!("{}:{}", self.host, port);
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(FastCgiError::Connect { addr, source }),
            Err(_) => return Err(FastCgiError::ConnectTimeout(addr)),
        };
        let _ = stream.set_nodelay(true);

        exchange(stream, request, self.read_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn test_request() -> ScriptRequest {
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", HeaderValue::from_static("test-agent"));
        headers.insert("x-custom-thing", HeaderValue::from_static("42"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        ScriptRequest {
            method: Method::POST,
            script_filename: PathBuf::from("/srv/www/a.test/public_www/index.php"),
            script_name: "/index.php".to_string(),
            document_root: PathBuf::from("/srv/www/a.test/public_www"),
            request_uri: "/app/route?x=1".to_string(),
            path_info: "/app/route".to_string(),
            query_string: "x=1".to_string(),
            server_name: "a.test".to_string(),
            client_ip: "10.1.2.3".to_string(),
            is_tls: true,
            headers,
            body: Bytes::from_static(b"hello"),
        }
    }

    fn record(record_type: RecordType, content: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_record(&mut buf, record_type, REQUEST_ID, content);
        buf
    }

    fn end_request() -> Vec<u8> {
        record(RecordType::EndRequest, &[0, 0, 0, 0, 0, 0, 0, 0])
    }

    /// Reads the client's request, then writes `reply` records
    async fn serve(mut server: DuplexStream, reply: Vec<Vec<u8>>) -> Vec<u8> {
        let mut received = Vec::new();
        let mut reader = RecordReader::new(&mut server, Duration::from_secs(5));
        loop {
            let record = reader.next_record().await.unwrap();
            let done = record.kind() == Some(RecordType::Stdin) && record.content.is_empty();
            received.extend_from_slice(&record.header.encode());
            received.extend_from_slice(&record.content);
            if done {
                break;
            }
        }
        for chunk in reply {
            server.write_all(&chunk).await.unwrap();
        }
        received
    }

    async fn body_string(response: Response<ResponseBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_padding() {
        assert_eq!(padding_for(0), 0);
        assert_eq!(padding_for(1), 7);
        assert_eq!(padding_for(8), 0);
        assert_eq!(padding_for(13), 3);
        assert_eq!(padding_for(MAX_CONTENT_LEN), 1);
    }

    #[test]
    fn test_header_layout() {
        let header = RecordHeader::new(RecordType::Params, 0x0102, 0x0304);
        let bytes = header.encode();
        assert_eq!(bytes, [1, 4, 0x01, 0x02, 0x03, 0x04, 4, 0]);
        assert_eq!(RecordHeader::decode(&bytes), header);
    }

    #[test]
    fn test_record_is_padded_to_eight() {
        let buf = record(RecordType::Stdout, b"abc");
        assert_eq!(buf.len(), HEADER_LEN + 8);
        assert_eq!(buf[6], 5);
        assert_eq!(&buf[HEADER_LEN..HEADER_LEN + 3], b"abc");
    }

    #[test]
    fn test_param_length_forms() {
        let mut params = BTreeMap::new();
        params.insert("A".to_string(), "x".repeat(200));
        let encoded = encode_params(&params);

        assert_eq!(encoded[0], 1);
        assert_eq!(&encoded[1..5], &(200u32 | 0x8000_0000).to_be_bytes());
        assert_eq!(encoded[5], b'A');
        assert_eq!(encoded.len(), 1 + 4 + 1 + 200);

        let mut params = BTreeMap::new();
        params.insert("B".to_string(), "y".repeat(127));
        assert_eq!(encode_params(&params)[1], 127);
    }

    #[test]
    fn test_stream_chunking() {
        let data = vec![7u8; MAX_CONTENT_LEN + 10];
        let mut buf = Vec::new();
        encode_stream(&mut buf, RecordType::Stdin, 1, &data);

        let first = RecordHeader::decode(buf[..HEADER_LEN].try_into().unwrap());
        assert_eq!(first.content_length as usize, MAX_CONTENT_LEN);
        assert_eq!(first.padding_length, 1);

        let offset = HEADER_LEN + MAX_CONTENT_LEN + 1;
        let second = RecordHeader::decode(buf[offset..offset + HEADER_LEN].try_into().unwrap());
        assert_eq!(second.content_length, 10);
        assert_eq!(second.padding_length, 6);

        let offset = offset + HEADER_LEN + 16;
        let terminator = RecordHeader::decode(buf[offset..offset + HEADER_LEN].try_into().unwrap());
        assert_eq!(terminator.content_length, 0);
        assert_eq!(buf.len(), offset + HEADER_LEN);
    }

    #[test]
    fn test_request_params() {
        let params = test_request().params();

        assert_eq!(params["REQUEST_METHOD"], "POST");
        assert_eq!(params["REQUEST_URI"], "/app/route?x=1");
        assert_eq!(params["PATH_INFO"], "/app/route");
        assert_eq!(params["SCRIPT_NAME"], "/index.php");
        assert_eq!(params["SCRIPT_FILENAME"], "/srv/www/a.test/public_www/index.php");
        assert_eq!(params["CONTENT_LENGTH"], "5");
        assert_eq!(params["CONTENT_TYPE"], "text/plain");
        assert_eq!(params["SERVER_PORT"], "443");
        assert_eq!(params["HTTPS"], "on");
        assert_eq!(params["REMOTE_ADDR"], "10.1.2.3");
        assert_eq!(params["HTTP_USER_AGENT"], "test-agent");
        assert_eq!(params["HTTP_X_CUSTOM_THING"], "42");
    }

    #[test]
    fn test_find_header_end() {
        assert_eq!(find_header_end(b"A: b\r\n\r\nbody"), Some((4, 4)));
        assert_eq!(find_header_end(b"A: b\n\nbody"), Some((4, 2)));
        assert_eq!(find_header_end(b"A: b\n\nbody\r\n\r\n"), Some((4, 2)));
        assert_eq!(find_header_end(b"A: b\r\n"), None);
    }

    #[test]
    fn test_parse_headers() {
        let head = parse_headers(
            b"Content-Type: text/html\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\nX-Powered-By: PHP\r\nX-Powered-By: Other",
        );
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.headers["content-type"], "text/html");
        assert_eq!(head.headers.get_all(SET_COOKIE).iter().count(), 2);
        assert_eq!(head.headers["x-powered-by"], "Other");
    }

    #[test]
    fn test_parse_headers_status_and_location() {
        let head = parse_headers(b"Location: /login");
        assert_eq!(head.status, StatusCode::FOUND);
        assert_eq!(head.headers[LOCATION], "/login");

        let head = parse_headers(b"Status: 301 Moved Permanently\nLocation: /new");
        assert_eq!(head.status, StatusCode::MOVED_PERMANENTLY);

        let head = parse_headers(b"Status: 404 Not Found\nContent-Type: text/plain");
        assert_eq!(head.status, StatusCode::NOT_FOUND);
        assert!(head.headers.get("status").is_none());
    }

    #[tokio::test]
    async fn test_exchange_headers_split_across_records() {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let server_task = tokio::spawn(serve(
            server,
            vec![
                record(RecordType::Stdout, b"Content-Type: text/pl"),
                record(RecordType::Stderr, b"notice: something"),
                record(RecordType::Stdout, b"ain\r\nX-A: 1\r\n\r\nfirst "),
                record(RecordType::Stdout, b"second"),
                record(RecordType::Stdout, b""),
                end_request(),
            ],
        ));

        let response = exchange(client, &test_request(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/plain");
        assert_eq!(response.headers()["x-a"], "1");

        let body = body_string(response).await;
        assert_eq!(body, "first second");
        assert!(!body.contains("notice"));

        let received = server_task.await.unwrap();
        assert_eq!(received[1], RecordType::BeginRequest as u8);
        let text = String::from_utf8_lossy(&received);
        assert!(text.contains("SCRIPT_FILENAME"));
        assert!(text.contains("hello"));
    }

    #[tokio::test]
    async fn test_exchange_end_without_headers() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(
            server,
            vec![record(RecordType::Stdout, b"no separator here"), end_request()],
        ));

        let response = exchange(client, &test_request(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "no separator here");
    }

    #[tokio::test]
    async fn test_exchange_body_chunks_arrive_before_end() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            let mut server = server;
            let mut reader = RecordReader::new(&mut server, Duration::from_secs(5));
            loop {
                let record = reader.next_record().await.unwrap();
                if record.kind() == Some(RecordType::Stdin) && record.content.is_empty() {
                    break;
                }
            }
            server
                .write_all(&record(RecordType::Stdout, b"Content-Type: text/event-stream\n\ndata: 1\n\n"))
                .await
                .unwrap();
            let _ = release_rx.await;
            server.write_all(&record(RecordType::Stdout, b"data: 2\n\n")).await.unwrap();
            server.write_all(&end_request()).await.unwrap();
        });

        let response = exchange(client, &test_request(), Duration::from_secs(5))
            .await
            .unwrap();
        let mut body = response.into_body();

        let first = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(&first[..], b"data: 1\n\n");

        release_tx.send(()).unwrap();
        let second = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(&second[..], b"data: 2\n\n");
        assert!(body.frame().await.is_none());
    }

    #[tokio::test]
    async fn test_exchange_separator_split_across_records() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(
            server,
            vec![
                record(RecordType::Stdout, b"X-A: 1\r\n\r"),
                record(RecordType::Stdout, b"\nbody"),
                end_request(),
            ],
        ));

        let response = exchange(client, &test_request(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.headers()["x-a"], "1");
        assert_eq!(body_string(response).await, "body");
    }

    #[tokio::test]
    async fn test_read_timeout_is_per_record() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let mut server = server;
            let mut reader = RecordReader::new(&mut server, Duration::from_secs(5));
            loop {
                let record = reader.next_record().await.unwrap();
                if record.kind() == Some(RecordType::Stdin) && record.content.is_empty() {
                    break;
                }
            }
            server
                .write_all(&record(RecordType::Stdout, b"Content-Type: text/plain\r\n\r\n"))
                .await
                .unwrap();
            for chunk in ["a", "b", "c", "d", "e"] {
                tokio::time::sleep(Duration::from_millis(100)).await;
                server.write_all(&record(RecordType::Stdout, chunk.as_bytes())).await.unwrap();
            }
            server.write_all(&end_request()).await.unwrap();
        });

        // Each gap is below the timeout; the whole response takes longer
        let started = std::time::Instant::now();
        let response = exchange(client, &test_request(), Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(body_string(response).await, "abcde");
        assert!(started.elapsed() > Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_exchange_oversized_header_block() {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let chunk = vec![b'a'; MAX_CONTENT_LEN];
        tokio::spawn(serve(
            server,
            vec![
                record(RecordType::Stdout, &chunk),
                record(RecordType::Stdout, &chunk),
                end_request(),
            ],
        ));

        let err = exchange(client, &test_request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, FastCgiError::Protocol(_)));
        assert_eq!(err.gateway_code(), GatewayErrorCode::BadGateway);
    }

    #[tokio::test]
    async fn test_exchange_truncated_record() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let mut server = server;
            let mut reader = RecordReader::new(&mut server, Duration::from_secs(5));
            loop {
                let record = reader.next_record().await.unwrap();
                if record.kind() == Some(RecordType::Stdin) && record.content.is_empty() {
                    break;
                }
            }
            let full = record(RecordType::Stdout, b"Status: 200\r\n\r\n");
            server.write_all(&full[..HEADER_LEN + 4]).await.unwrap();
        });

        let err = exchange(client, &test_request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, FastCgiError::UnexpectedEof));
        assert_eq!(err.gateway_code(), GatewayErrorCode::BadGateway);
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (client, _server) = tokio::io::duplex(64 * 1024);
        let err = exchange(client, &test_request(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, FastCgiError::ReadTimeout(_)));
        assert_eq!(err.gateway_code(), GatewayErrorCode::GatewayTimeout);
    }

    #[tokio::test]
    async fn test_connect_failure_is_service_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = FastCgiClient::new("127.0.0.1", Duration::from_secs(1), Duration::from_secs(1));
        let err = client.execute(port, &test_request()).await.unwrap_err();
        assert!(matches!(err, FastCgiError::Connect { .. }));
        assert_eq!(err.gateway_code(), GatewayErrorCode::ServiceUnavailable);
    }
}
