use crate::access::{check_proxy_access, AccessDecision, ErrorDirective};
use crate::config::{ProxyRoute, ServerConfig};
use crate::error::{
    error_response, https_redirect, not_found_page, redirect_response, GatewayErrorCode,
    ResponseBody,
};
use crate::static_files::{decode_path, normalize_path};
use futures::TryStreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Body, Bytes, Frame};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH};
use hyper::{Request, Response, StatusCode};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info};

/// Header name for the client address
const X_REAL_IP: &str = "x-real-ip";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Connection-management headers that never reach the backend
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "upgrade",
    "proxy-connection",
    "te",
    "trailers",
    "transfer-encoding",
];

const BACKEND_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Forwards requests for configured external domains to local backends
pub struct ReverseProxy {
    client: reqwest::Client,
    /// Used for routes whose backend speaks HTTPS with a self-signed certificate
    insecure_client: reqwest::Client,
    access_root: PathBuf,
    error_page: PathBuf,
    https_port: u16,
}

impl ReverseProxy {
    pub fn new(server: &ServerConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .connect_timeout(BACKEND_CONNECT_TIMEOUT)
            .build()?;
        let insecure_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .connect_timeout(BACKEND_CONNECT_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Self {
            client,
            insecure_client,
            access_root: server.proxy_access_root.clone(),
            error_page: server.error_page.clone(),
            https_port: server.https_port,
        })
    }

    /// Serve a request already matched to `route`.
    ///
    /// `host` is the request host without port.
    pub async fn handle<B>(
        &self,
        route: &ProxyRoute,
        host: &str,
        req: Request<B>,
        client_addr: SocketAddr,
        is_tls: bool,
    ) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes>,
        B::Error: std::fmt::Display,
    {
        let client = client_addr.ip().to_string();
        let Some(path) = normalize_path(&decode_path(req.uri().path())) else {
            info!(component = "proxy", host, path = %req.uri().path(), client = %client, "Rejected path with parent segments");
            return not_found_page(&self.error_page, StatusCode::FORBIDDEN);
        };

        if let AccessDecision::Denied(directive) =
            check_proxy_access(&self.access_root, &route.external_domain, &path, &client)
        {
            info!(
                component = "proxy",
                host,
                path = %path,
                client = %client,
                "Proxy access denied"
            );
            return match directive {
                ErrorDirective::Redirect(url) => redirect_response(StatusCode::FOUND, &url),
                ErrorDirective::NotFound | ErrorDirective::LocalFile(_) => {
                    not_found_page(&self.error_page, StatusCode::FORBIDDEN)
                }
            };
        }

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        if route.auto_https && !is_tls {
            debug!(host, "Redirecting proxied host to HTTPS");
            return https_redirect(host, self.https_port, &path_and_query);
        }

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!(host, error = %e, "Failed to read request body");
                return error_response(GatewayErrorCode::BadRequest, "Failed to read request body");
            }
        };

        let proto = if is_tls { "https" } else { "http" };
        let headers = forward_headers(&parts.headers, &client, proto, body.len());
        let url = format!("{}{}", route.backend_url(), path_and_query);
        let backend = if route.service_https_use {
            &self.insecure_client
        } else {
            &self.client
        };

        debug!(host, method = %parts.method, url = %url, "Forwarding request");

        let upstream = match backend
            .request(parts.method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await
        {
            Ok(upstream) => upstream,
            Err(e) => {
                error!(component = "proxy", host, url = %url, error = %e, "Backend request failed");
                return error_response(GatewayErrorCode::BadGateway, "Failed to connect to backend");
            }
        };

        relay_response(upstream)
    }
}

/// Inbound headers minus hop-by-hop ones, with client forwarding headers set
pub fn forward_headers(
    inbound: &HeaderMap,
    client: &str,
    proto: &str,
    body_len: usize,
) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 4);
    for (name, value) in inbound {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    // Overwritten rather than appended so clients cannot spoof them
    if let Ok(value) = HeaderValue::from_str(client) {
        headers.insert(HeaderName::from_static(X_REAL_IP), value.clone());
        headers.insert(HeaderName::from_static(X_FORWARDED_FOR), value);
    }
    if let Ok(value) = HeaderValue::from_str(proto) {
        headers.insert(HeaderName::from_static(X_FORWARDED_PROTO), value);
    }
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body_len));

    headers
}

/// Status and headers copied verbatim, body streamed through
fn relay_response(upstream: reqwest::Response) -> Response<ResponseBody> {
    let status = upstream.status();
    let headers = upstream.headers().clone();

    let stream = upstream
        .bytes_stream()
        .map_ok(Frame::data)
        .map_err(std::io::Error::other);

    let mut response = Response::new(StreamBody::new(stream).boxed_unsync());
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper::header::{HOST, LOCATION};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn route(port: u16) -> ProxyRoute {
        ProxyRoute {
            enable: true,
            external_domain: "git.example.com".to_string(),
            local_address: "127.0.0.1".to_string(),
            local_port: port.to_string(),
            service_https_use: false,
            auto_https: false,
            auto_create_ssl: false,
        }
    }

    fn server_config(access_root: &std::path::Path) -> ServerConfig {
        ServerConfig {
            proxy_access_root: access_root.to_path_buf(),
            error_page: access_root.join("missing-error-page.html"),
            https_port: 443,
            ..ServerConfig::default()
        }
    }

    fn request(uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .uri(uri)
            .header(HOST, "git.example.com")
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    fn client_addr() -> SocketAddr {
        "10.0.0.7:52344".parse().unwrap()
    }

    /// Accepts one connection, answers with `reply` and hands back the raw request head
    async fn one_shot_backend(reply: &'static str) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            while !received.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            stream.write_all(reply.as_bytes()).await.unwrap();
            stream.shutdown().await.ok();
            String::from_utf8_lossy(&received).to_string()
        });
        (port, handle)
    }

    #[test]
    fn test_forward_headers_strips_hop_by_hop() {
        let mut inbound = HeaderMap::new();
        inbound.insert("connection", HeaderValue::from_static("keep-alive, upgrade"));
        inbound.insert("upgrade", HeaderValue::from_static("websocket"));
        inbound.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        inbound.insert("te", HeaderValue::from_static("trailers"));
        inbound.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        inbound.insert("x-forwarded-for", HeaderValue::from_static("6.6.6.6"));
        inbound.insert("accept", HeaderValue::from_static("text/html"));
        inbound.append("cookie", HeaderValue::from_static("a=1"));
        inbound.append("cookie", HeaderValue::from_static("b=2"));

        let headers = forward_headers(&inbound, "10.0.0.7", "https", 12);

        for name in HOP_BY_HOP_HEADERS {
            assert!(!headers.contains_key(*name), "{} should be stripped", name);
        }
        assert_eq!(headers["accept"], "text/html");
        assert_eq!(headers.get_all("cookie").iter().count(), 2);
        assert_eq!(headers[X_FORWARDED_FOR], "10.0.0.7");
        assert_eq!(headers[X_REAL_IP], "10.0.0.7");
        assert_eq!(headers[X_FORWARDED_PROTO], "https");
        assert_eq!(headers[CONTENT_LENGTH], "12");
    }

    #[tokio::test]
    async fn test_access_denied_returns_403() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("git.example.com_vAccess.conf"),
            "type: Disable\npath_access: /admin/*\n",
        )
        .unwrap();
        let proxy = ReverseProxy::new(&server_config(dir.path())).unwrap();

        // No backend listens on port 1; a denied request never reaches it
        let response = proxy
            .handle(&route(1), "git.example.com", request("/admin/panel"), client_addr(), false)
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_access_rules_see_normalized_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("git.example.com_vAccess.conf"),
            "type: Disable\npath_access: /admin/*\n",
        )
        .unwrap();
        let proxy = ReverseProxy::new(&server_config(dir.path())).unwrap();

        for uri in ["//admin/panel", "/./admin/panel", "/%2Fadmin/panel", "/x/../admin/panel"] {
            let response = proxy
                .handle(&route(1), "git.example.com", request(uri), client_addr(), false)
                .await;
            assert_eq!(response.status(), StatusCode::FORBIDDEN, "uri {}", uri);
        }
    }

    #[tokio::test]
    async fn test_access_denied_redirect_directive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("git.example.com_vAccess.conf"),
            "type: Disable\npath_access: /admin/*\nurl_error: https://example.com/nope\n",
        )
        .unwrap();
        let proxy = ReverseProxy::new(&server_config(dir.path())).unwrap();

        let response = proxy
            .handle(&route(1), "git.example.com", request("/admin/"), client_addr(), false)
            .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[LOCATION], "https://example.com/nope");
    }

    #[tokio::test]
    async fn test_auto_https_redirects_plain_http() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = ReverseProxy::new(&server_config(dir.path())).unwrap();
        let mut route = route(1);
        route.auto_https = true;

        let response = proxy
            .handle(&route, "git.example.com", request("/repo?tab=1"), client_addr(), false)
            .await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers()[LOCATION],
            "https://git.example.com/repo?tab=1"
        );
    }

    #[tokio::test]
    async fn test_dead_backend_returns_502() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = ReverseProxy::new(&server_config(dir.path())).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let response = proxy
            .handle(&route(port), "git.example.com", request("/"), client_addr(), false)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()["x-gateway-error"], "BAD_GATEWAY");
    }

    #[tokio::test]
    async fn test_forwards_and_does_not_follow_redirects() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = ReverseProxy::new(&server_config(dir.path())).unwrap();
        let (port, backend) = one_shot_backend(
            "HTTP/1.1 302 Found\r\nLocation: /login\r\nX-Backend: yes\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;

        let response = proxy
            .handle(&route(port), "git.example.com", request("/repo?x=1"), client_addr(), false)
            .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[LOCATION], "/login");
        assert_eq!(response.headers()["x-backend"], "yes");

        let head = backend.await.unwrap().to_ascii_lowercase();
        assert!(head.starts_with("get /repo?x=1 http/1.1"));
        assert!(head.contains("x-forwarded-for: 10.0.0.7"));
        assert!(head.contains("x-real-ip: 10.0.0.7"));
        assert!(head.contains("x-forwarded-proto: http"));
        assert!(head.contains("host: git.example.com"));
    }
}
