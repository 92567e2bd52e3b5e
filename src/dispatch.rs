//! Per-request routing for virtual hosts.
//!
//! A request is offered to the reverse proxy first, then checked against the
//! site's access rules, upgraded to HTTPS when a certificate exists, and
//! finally resolved to a file that is either sent as-is or run through a
//! FastCGI worker.

use crate::access::{check_site_access, client_ip, AccessDecision, ErrorDirective};
use crate::certs::CertificateStore;
use crate::config::{Config, SiteConfig};
use crate::error::{
    error_response, https_redirect, not_found_page, redirect_response, GatewayErrorCode,
    ResponseBody,
};
use crate::fastcgi::{FastCgiClient, ScriptRequest};
use crate::proxy::ReverseProxy;
use crate::static_files::{decode_path, join_request_path, normalize_path, serve_file};
use crate::workers::WorkerPool;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HOST};
use hyper::{Method, Request, Response, StatusCode, Uri};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

/// What the client asked for, after host resolution
struct RequestContext {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    /// Host as sent by the client, port stripped
    request_host: String,
    /// Canonical site host (alias resolved)
    host: String,
    /// Percent-decoded request path with empty and `.` segments removed
    path: String,
    client: String,
    is_tls: bool,
}

impl RequestContext {
    fn request_uri(&self) -> String {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string())
    }
}

/// Where a request ends up inside a document root
#[derive(Debug, PartialEq, Eq)]
enum Target {
    /// Path below the document root, starting with `/`
    File(String),
    NotFound,
}

/// Routes requests to the proxy, static files or FastCGI workers
pub struct Dispatcher {
    config: Arc<Config>,
    certs: Arc<CertificateStore>,
    workers: Arc<WorkerPool>,
    fastcgi: FastCgiClient,
    proxy: ReverseProxy,
}

impl Dispatcher {
    pub fn new(
        config: Arc<Config>,
        certs: Arc<CertificateStore>,
        workers: Arc<WorkerPool>,
    ) -> anyhow::Result<Self> {
        let fastcgi = FastCgiClient::from_config(&config.fastcgi);
        let proxy = ReverseProxy::new(&config.server)?;
        Ok(Self {
            config,
            certs,
            workers,
            fastcgi,
            proxy,
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub async fn dispatch<B>(
        &self,
        req: Request<B>,
        client_addr: SocketAddr,
        is_tls: bool,
    ) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes>,
        B::Error: std::fmt::Display,
    {
        let Some(request_host) = request_host(&req) else {
            return error_response(GatewayErrorCode::BadRequest, "Missing or invalid Host header");
        };

        let site = self.config.find_site(&request_host);
        let host = site
            .map(|s| s.host.to_ascii_lowercase())
            .unwrap_or_else(|| request_host.clone());

        if self.config.server.proxy_enabled {
            if let Some(route) = self.config.find_proxy(&request_host) {
                return self
                    .proxy
                    .handle(route, &request_host, req, client_addr, is_tls)
                    .await;
            }
        }

        let (parts, body) = req.into_parts();
        let client = client_ip(&client_addr.to_string());
        let Some(path) = normalize_path(&decode_path(parts.uri.path())) else {
            info!(host = %host, path = %parts.uri.path(), client = %client, "Rejected path with parent segments");
            return self.not_found();
        };
        let ctx = RequestContext {
            path,
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            request_host,
            host,
            client,
            is_tls,
        };

        let site_dir = self.config.server.site_dir(&ctx.host);
        if let Some(denied) = self.check_access(&ctx, &site_dir, &ctx.path).await {
            return denied;
        }

        if !ctx.is_tls && self.certs.has_certificate(&ctx.request_host) {
            debug!(host = %ctx.request_host, "Certificate present, redirecting to HTTPS");
            return https_redirect(
                &ctx.request_host,
                self.config.server.https_port,
                &ctx.request_uri(),
            );
        }

        debug!(
            host = %ctx.host,
            path = %ctx.path,
            client = %ctx.client,
            tls = ctx.is_tls,
            "Handling request"
        );

        let Some(site) = site else {
            info!(host = %ctx.host, client = %ctx.client, "No active site for host");
            return self.not_found();
        };

        let document_root = self.config.server.document_root(&site.host);
        if !tokio::fs::metadata(&document_root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            info!(
                host = %ctx.host,
                root = %document_root.display(),
                "Site document root not found"
            );
            return self.not_found();
        }

        match resolve_target(site, &document_root, &ctx.path).await {
            Target::File(file) => {
                // Rules also apply to the file actually answering the request
                for path in access_aliases(&ctx.path, &file) {
                    if let Some(denied) = self.check_access(&ctx, &site_dir, &path).await {
                        return denied;
                    }
                }
                self.route_file(&ctx, &document_root, &file, body).await
            }
            Target::NotFound => {
                info!(
                    host = %ctx.host,
                    path = %ctx.path,
                    client = %ctx.client,
                    candidates = %site.root_files().join(", "),
                    "Not found"
                );
                self.not_found()
            }
        }
    }

    /// Rendered denial when the site's rules refuse `path`
    async fn check_access(
        &self,
        ctx: &RequestContext,
        site_dir: &Path,
        path: &str,
    ) -> Option<Response<ResponseBody>> {
        let AccessDecision::Denied(directive) = check_site_access(site_dir, path, &ctx.client) else {
            return None;
        };
        info!(
            component = "access",
            host = %ctx.host,
            path = %path,
            client = %ctx.client,
            directive = ?directive,
            "Access denied"
        );
        Some(self.render_denial(ctx, directive).await)
    }

    fn not_found(&self) -> Response<ResponseBody> {
        not_found_page(&self.config.server.error_page, StatusCode::OK)
    }

    async fn render_denial(
        &self,
        ctx: &RequestContext,
        directive: ErrorDirective,
    ) -> Response<ResponseBody> {
        match directive {
            ErrorDirective::NotFound => self.not_found(),
            ErrorDirective::Redirect(url) => redirect_response(StatusCode::FOUND, &url),
            ErrorDirective::LocalFile(page) => {
                let document_root = self.config.server.document_root(&ctx.host);
                let served = match join_request_path(&document_root, &page) {
                    Some(file) => serve_file(&document_root, &file, &ctx.method).await,
                    None => None,
                };
                served.unwrap_or_else(|| {
                    error!(host = %ctx.host, page = %page, "Access error page not found");
                    self.not_found()
                })
            }
        }
    }

    /// Send `file` statically, or run it when it is a script
    async fn route_file<B>(
        &self,
        ctx: &RequestContext,
        document_root: &Path,
        file: &str,
        body: B,
    ) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes>,
        B::Error: std::fmt::Display,
    {
        let Some(full_path) = join_request_path(document_root, file) else {
            return self.not_found();
        };

        if !self.config.fastcgi.is_script(&full_path) {
            return match serve_file(document_root, &full_path, &ctx.method).await {
                Some(response) => response,
                None => {
                    debug!(host = %ctx.host, file, "Static file unavailable");
                    self.not_found()
                }
            };
        }

        self.run_script(ctx, document_root, file, &full_path, body).await
    }

    async fn run_script<B>(
        &self,
        ctx: &RequestContext,
        document_root: &Path,
        script_name: &str,
        script_path: &Path,
        body: B,
    ) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes>,
        B::Error: std::fmt::Display,
    {
        let (script_filename, document_root) = match (
            tokio::fs::canonicalize(script_path).await,
            tokio::fs::canonicalize(document_root).await,
        ) {
            (Ok(script), Ok(root)) if script.starts_with(&root) => (script, root),
            _ => {
                debug!(host = %ctx.host, script = %script_path.display(), "Script not found");
                return self.not_found();
            }
        };

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!(host = %ctx.host, error = %e, "Failed to read request body");
                return error_response(GatewayErrorCode::BadRequest, "Failed to read request body");
            }
        };

        let Some(port) = self.workers.next_port() else {
            error!(component = "fastcgi", "No FastCGI workers configured");
            return error_response(GatewayErrorCode::ServiceUnavailable, "Service Unavailable");
        };

        let request = ScriptRequest {
            method: ctx.method.clone(),
            script_filename,
            script_name: script_name.to_string(),
            document_root,
            request_uri: ctx.request_uri(),
            path_info: ctx.path.clone(),
            query_string: ctx.uri.query().unwrap_or("").to_string(),
            server_name: ctx.request_host.clone(),
            client_ip: ctx.client.clone(),
            is_tls: ctx.is_tls,
            headers: ctx.headers.clone(),
            body,
        };

        match self.fastcgi.execute(port, &request).await {
            Ok(response) => {
                debug!(host = %ctx.host, script = script_name, port, status = %response.status(), "Script executed");
                response
            }
            Err(e) => {
                let code = e.gateway_code();
                error!(component = "fastcgi", host = %ctx.host, script = script_name, port, error = %e, "Script execution failed");
                let reason = code.status_code().canonical_reason().unwrap_or("Gateway Error");
                error_response(code, reason)
            }
        }
    }
}

/// Host the client asked for, lower-cased and without port.
///
/// HTTP/2 requests carry it in the URI authority instead of a Host header.
fn request_host<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))?;

    let host = strip_port(raw.trim());
    if host.is_empty() {
        return None;
    }
    Some(host.to_ascii_lowercase())
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Paths besides the request path that rules are checked against.
///
/// A directory request is also checked in its trailing-slash form, and the
/// resolved file whenever it differs from the request path.
fn access_aliases(request_path: &str, file: &str) -> Vec<String> {
    let mut paths = Vec::new();
    if !request_path.ends_with('/') {
        let dir = format!("{}/", request_path);
        if file.starts_with(&dir) {
            paths.push(dir);
        }
    }
    if file != request_path {
        paths.push(file.to_string());
    }
    paths
}

/// First index file that exists in `dir` (a request path ending in `/`)
async fn find_index(site: &SiteConfig, document_root: &Path, dir: &str) -> Option<String> {
    for name in site.root_files() {
        let candidate = format!("{}{}", dir, name);
        let Some(path) = join_request_path(document_root, &candidate) else {
            continue;
        };
        if tokio::fs::metadata(&path).await.is_ok() {
            return Some(candidate);
        }
    }
    None
}

/// Map a request path to the file that answers it
async fn resolve_target(site: &SiteConfig, document_root: &Path, path: &str) -> Target {
    if path == "/" {
        return find_index(site, document_root, "/")
            .await
            .map_or(Target::NotFound, Target::File);
    }

    let on_disk: Option<PathBuf> = join_request_path(document_root, path);
    let metadata = match &on_disk {
        Some(p) => tokio::fs::metadata(p).await.ok(),
        None => None,
    };

    match metadata {
        Some(m) if m.is_dir() => {
            let dir = if path.ends_with('/') {
                path.to_string()
            } else {
                format!("{}/", path)
            };
            find_index(site, document_root, &dir)
                .await
                .map_or(Target::NotFound, Target::File)
        }
        Some(_) => Target::File(path.to_string()),
        None if site.root_file_routing => find_index(site, document_root, "/")
            .await
            .map_or(Target::NotFound, Target::File),
        None => Target::NotFound,
    }
}
