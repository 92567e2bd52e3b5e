//! Hierarchical access rules (`vAccess.conf`)
//!
//! A rule file is a list of colon-delimited directives grouped into blocks:
//!
//! ```text
//! # block uploads from running scripts
//! type: Disable
//! type_file: *.php, *.phtml
//! path_access: /uploads/*
//! exceptions_dir: /uploads/safe/*
//! url_error: 404
//! ```
//!
//! `type` opens a rule, a `#` line closes it. Site rule files are discovered
//! from `<www_root>/<host>/vAccess.conf` down to the directory of the requested
//! path and evaluated root to leaf; the first denial wins.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Name of per-directory rule files
pub const RULE_FILE_NAME: &str = "vAccess.conf";

/// Suffix of per-domain proxy rule files
pub const PROXY_RULE_FILE_SUFFIX: &str = "_vAccess.conf";

/// Extension list entry matching paths without any extension
pub const NO_EXTENSION: &str = "no_extension";

/// Error directive used when a rule has no `url_error`
pub const DEFAULT_ERROR_DIRECTIVE: &str = "404";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleKind {
    Allow,
    /// Written as `Disable` in rule files
    Deny,
    /// Kept from the file but never decides anything
    Unknown(String),
}

impl RuleKind {
    fn parse(value: &str) -> Self {
        match value.trim() {
            "Allow" => RuleKind::Allow,
            "Disable" | "Deny" => RuleKind::Deny,
            other => RuleKind::Unknown(other.to_string()),
        }
    }
}

/// What to send when a rule denies a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorDirective {
    /// The generic not-found page
    NotFound,
    /// Absolute URL to redirect to
    Redirect(String),
    /// File relative to the document root
    LocalFile(String),
}

impl ErrorDirective {
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() || value == DEFAULT_ERROR_DIRECTIVE {
            ErrorDirective::NotFound
        } else if value.starts_with("http://") || value.starts_with("https://") {
            ErrorDirective::Redirect(value.to_string())
        } else {
            ErrorDirective::LocalFile(value.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRule {
    pub kind: RuleKind,
    /// `type_file`: allowed extensions, `*.ext` globs or `no_extension`
    pub extensions: Vec<String>,
    /// `path_access`: exact paths or `/prefix/*`
    pub paths: Vec<String>,
    /// `ip_list`
    pub ips: Vec<String>,
    /// `exceptions_dir`: paths exempt from this rule
    pub exceptions: Vec<String>,
    /// `url_error`
    pub error: ErrorDirective,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    Denied(ErrorDirective),
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allowed)
    }
}

#[derive(Default)]
struct PendingRule {
    kind: String,
    extensions: Vec<String>,
    paths: Vec<String>,
    ips: Vec<String>,
    exceptions: Vec<String>,
    error: Option<String>,
}

impl PendingRule {
    /// A rule needs a kind and at least one of extension, path or IP filters
    fn finish(self) -> Option<AccessRule> {
        if self.kind.is_empty() {
            return None;
        }
        if self.extensions.is_empty() && self.paths.is_empty() && self.ips.is_empty() {
            return None;
        }
        Some(AccessRule {
            kind: RuleKind::parse(&self.kind),
            extensions: self.extensions,
            paths: self.paths,
            ips: self.ips,
            exceptions: self.exceptions,
            error: ErrorDirective::parse(self.error.as_deref().unwrap_or(DEFAULT_ERROR_DIRECTIVE)),
        })
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

/// Parse a rule file. Invalid rules are dropped.
pub fn parse_rules(content: &str) -> Vec<AccessRule> {
    let mut rules = Vec::new();
    let mut current: Option<PendingRule> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with('#') {
            if let Some(rule) = current.take().and_then(PendingRule::finish) {
                rules.push(rule);
            }
            continue;
        }

        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        if key == "type" {
            let rule = current.get_or_insert_with(PendingRule::default);
            rule.kind = value.to_string();
            continue;
        }

        let Some(rule) = current.as_mut() else {
            continue;
        };
        match key {
            "type_file" => rule.extensions = split_list(value),
            "path_access" => rule.paths = split_list(value),
            "ip_list" => rule.ips = split_list(value),
            "exceptions_dir" => rule.exceptions = split_list(value),
            "url_error" => rule.error = Some(value.to_string()),
            _ => {}
        }
    }

    if let Some(rule) = current.and_then(PendingRule::finish) {
        rules.push(rule);
    }

    rules
}

pub fn load_rule_file(path: &Path) -> std::io::Result<Vec<AccessRule>> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_rules(&content))
}

/// Exact match, or prefix match for patterns ending in `/*`
pub fn matches_path(pattern: &str, path: &str) -> bool {
    let pattern = pattern.trim();
    match pattern.strip_suffix("/*") {
        Some(prefix) => prefix.is_empty() || path.starts_with(prefix),
        None => pattern == path,
    }
}

/// Every dotted suffix of every path segment, lower-cased.
///
/// `/a.b/c.tar.gz` yields `.b`, `.tar`, `.gz`.
pub fn path_extensions(path: &str) -> Vec<String> {
    let mut extensions = Vec::new();

    for segment in path.split('/') {
        let Some(first_dot) = segment.find('.') else {
            continue;
        };
        let mut rest = &segment[first_dot..];
        while rest.len() > 1 {
            match rest[1..].find('.') {
                Some(next) => {
                    let ext = &rest[..next + 1];
                    if ext.len() > 1 {
                        extensions.push(ext.to_lowercase());
                    }
                    rest = &rest[next + 1..];
                }
                None => {
                    extensions.push(rest.to_lowercase());
                    break;
                }
            }
        }
    }

    extensions
}

/// True when every extension of `path` appears in `allowed`
pub fn extensions_allowed(allowed: &[String], path: &str) -> bool {
    let found = path_extensions(path);
    if found.is_empty() {
        return allowed
            .iter()
            .any(|entry| entry.trim().eq_ignore_ascii_case(NO_EXTENSION));
    }

    found.iter().all(|ext| {
        allowed.iter().any(|entry| {
            let entry = entry.trim().to_lowercase();
            let entry = entry.strip_prefix('*').unwrap_or(&entry);
            entry == ext.as_str()
        })
    })
}

/// Client address without port and IPv6 brackets
pub fn client_ip(remote: &str) -> String {
    if let Some(rest) = remote.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest).to_string();
    }
    match remote.split_once(':') {
        // A second colon means a bare IPv6 address
        Some((host, port)) if !port.contains(':') => host.to_string(),
        _ => remote.to_string(),
    }
}

fn ip_listed(ips: &[String], client: &str) -> bool {
    ips.iter().any(|ip| ip.trim() == client)
}

/// Evaluate one rule list.
///
/// `check_extensions` turns `type_file` filters on or off for this caller.
pub fn evaluate(
    rules: &[AccessRule],
    request_path: &str,
    client: &str,
    check_extensions: bool,
) -> AccessDecision {
    for rule in rules {
        if !rule.paths.is_empty() && !rule.paths.iter().any(|p| matches_path(p, request_path)) {
            continue;
        }
        if rule.exceptions.iter().any(|p| matches_path(p, request_path)) {
            continue;
        }

        let extension_filter = (check_extensions && !rule.extensions.is_empty())
            .then(|| extensions_allowed(&rule.extensions, request_path));
        let ip_filter = (!rule.ips.is_empty()).then(|| ip_listed(&rule.ips, client));

        match &rule.kind {
            RuleKind::Allow => {
                // Every specified condition must hold
                let granted = extension_filter.unwrap_or(true) && ip_filter.unwrap_or(true);
                return if granted {
                    AccessDecision::Allowed
                } else {
                    AccessDecision::Denied(rule.error.clone())
                };
            }
            RuleKind::Deny => {
                // Blocks unless every specified condition fails to match
                let specified: Vec<bool> = [extension_filter, ip_filter].into_iter().flatten().collect();
                if specified.is_empty() || specified.contains(&true) {
                    return AccessDecision::Denied(rule.error.clone());
                }
            }
            RuleKind::Unknown(kind) => {
                debug!(kind, "Ignoring access rule with unknown type");
            }
        }
    }

    AccessDecision::Allowed
}

/// Rule files applying to `request_path`, root first.
///
/// `site_dir` is `<www_root>/<host>`; existence is not checked here.
pub fn rule_file_chain(site_dir: &Path, request_path: &str) -> Vec<PathBuf> {
    let mut files = vec![site_dir.join(RULE_FILE_NAME)];
    let mut dir = site_dir.to_path_buf();

    let segments: Vec<&str> = request_path
        .split('/')
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .collect();
    for segment in segments {
        dir.push(segment);
        files.push(dir.join(RULE_FILE_NAME));
    }

    files
}

/// Walk the rule hierarchy of a site; unreadable files are skipped
pub fn check_site_access(site_dir: &Path, request_path: &str, client: &str) -> AccessDecision {
    for file in rule_file_chain(site_dir, request_path) {
        if !file.is_file() {
            continue;
        }
        let rules = match load_rule_file(&file) {
            Ok(rules) => rules,
            Err(e) => {
                warn!(file = %file.display(), error = %e, "Skipping unreadable access rule file");
                continue;
            }
        };
        let decision = evaluate(&rules, request_path, client, true);
        if !decision.is_allowed() {
            debug!(file = %file.display(), path = request_path, "Access rule denied request");
            return decision;
        }
    }

    AccessDecision::Allowed
}

/// Rules for a proxied domain; a missing or unreadable file allows everything
pub fn check_proxy_access(
    proxy_access_root: &Path,
    domain: &str,
    request_path: &str,
    client: &str,
) -> AccessDecision {
    let file = proxy_access_root.join(format!("{}{}", domain, PROXY_RULE_FILE_SUFFIX));
    if !file.is_file() {
        return AccessDecision::Allowed;
    }

    match load_rule_file(&file) {
        Ok(rules) => evaluate(&rules, request_path, client, true),
        Err(e) => {
            warn!(file = %file.display(), error = %e, "Unreadable proxy access rule file, allowing");
            AccessDecision::Allowed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deny(extensions: &[&str], paths: &[&str], ips: &[&str]) -> AccessRule {
        AccessRule {
            kind: RuleKind::Deny,
            extensions: extensions.iter().map(|s| s.to_string()).collect(),
            paths: paths.iter().map(|s| s.to_string()).collect(),
            ips: ips.iter().map(|s| s.to_string()).collect(),
            exceptions: Vec::new(),
            error: ErrorDirective::NotFound,
        }
    }

    fn allow(extensions: &[&str], paths: &[&str], ips: &[&str]) -> AccessRule {
        AccessRule {
            kind: RuleKind::Allow,
            ..deny(extensions, paths, ips)
        }
    }

    #[test]
    fn test_parse_rule_blocks() {
        let content = r#"
            # uploads
            type: Disable
            type_file: *.php, *.phtml,
            path_access: /uploads/*
            exceptions_dir: /uploads/safe/*
            url_error: https://example.com/blocked

            # admin
            type: Allow
            ip_list: 10.0.0.1 , 10.0.0.2
            path_access: /admin/*
            url_error: /errors/denied.html
        "#;

        let rules = parse_rules(content);
        assert_eq!(rules.len(), 2);

        assert_eq!(rules[0].kind, RuleKind::Deny);
        assert_eq!(rules[0].extensions, vec!["*.php", "*.phtml"]);
        assert_eq!(rules[0].paths, vec!["/uploads/*"]);
        assert_eq!(rules[0].exceptions, vec!["/uploads/safe/*"]);
        assert_eq!(
            rules[0].error,
            ErrorDirective::Redirect("https://example.com/blocked".to_string())
        );

        assert_eq!(rules[1].kind, RuleKind::Allow);
        assert_eq!(rules[1].ips, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(
            rules[1].error,
            ErrorDirective::LocalFile("/errors/denied.html".to_string())
        );
    }

    #[test]
    fn test_parse_drops_invalid_rules() {
        let content = r#"
            path_access: /ignored/*
            type: Disable
            url_error: 404
            # no filters above, dropped
            type: Disable
            ip_list: 1.2.3.4
        "#;

        let rules = parse_rules(content);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].ips, vec!["1.2.3.4"]);
        assert!(rules[0].paths.is_empty());
        assert_eq!(rules[0].error, ErrorDirective::NotFound);
    }

    #[test]
    fn test_parse_empty_type_is_invalid() {
        let rules = parse_rules("type:\npath_access: /*\n");
        assert!(rules.is_empty());
    }

    #[test]
    fn test_matches_path() {
        assert!(matches_path("/admin", "/admin"));
        assert!(!matches_path("/admin", "/admin/users"));
        assert!(matches_path("/admin/*", "/admin/users"));
        assert!(matches_path("/admin/*", "/admin"));
        assert!(matches_path("/*", "/anything/at/all"));
        assert!(!matches_path("/admin/*", "/public"));
    }

    #[test]
    fn test_path_extensions() {
        assert_eq!(path_extensions("/archive.tar.gz"), vec![".tar", ".gz"]);
        assert_eq!(path_extensions("/a.b/c.TXT"), vec![".b", ".txt"]);
        assert_eq!(path_extensions("/.htaccess"), vec![".htaccess"]);
        assert!(path_extensions("/file.").is_empty());
        assert!(path_extensions("/plain/path").is_empty());
        assert_eq!(path_extensions("/a..b"), vec![".b"]);
    }

    #[test]
    fn test_extensions_allowed_requires_every_extension() {
        let both = vec!["*.tar".to_string(), ".gz".to_string()];
        let only_gz = vec!["*.gz".to_string()];

        assert!(extensions_allowed(&both, "/files/archive.tar.gz"));
        assert!(extensions_allowed(&both, "/files/archive.gz.tar"));
        assert!(!extensions_allowed(&only_gz, "/files/archive.tar.gz"));
    }

    #[test]
    fn test_no_extension_sentinel() {
        let list = vec![NO_EXTENSION.to_string()];
        assert!(extensions_allowed(&list, "/api/users"));
        assert!(!extensions_allowed(&list, "/api/users.json"));
        assert!(!extensions_allowed(&["*.json".to_string()], "/api/users"));
    }

    #[test]
    fn test_client_ip() {
        assert_eq!(client_ip("192.168.1.10:54321"), "192.168.1.10");
        assert_eq!(client_ip("[::1]:8080"), "::1");
        assert_eq!(client_ip("10.0.0.1"), "10.0.0.1");
        assert_eq!(client_ip("::1"), "::1");
    }

    #[test]
    fn test_scenario_uploads_php_denied() {
        let rules = parse_rules("type: Disable\ntype_file: *.php\npath_access: /uploads/*\n");

        assert_eq!(
            evaluate(&rules, "/uploads/shell.php", "1.2.3.4", true),
            AccessDecision::Denied(ErrorDirective::NotFound)
        );
        assert!(evaluate(&rules, "/uploads/image.png", "1.2.3.4", true).is_allowed());
        assert!(evaluate(&rules, "/index.php", "1.2.3.4", true).is_allowed());
    }

    #[test]
    fn test_exceptions_skip_rule() {
        let mut rule = deny(&[], &["/private/*"], &[]);
        rule.exceptions = vec!["/private/public/*".to_string()];
        let rules = vec![rule];

        assert!(!evaluate(&rules, "/private/secret.txt", "1.1.1.1", true).is_allowed());
        assert!(evaluate(&rules, "/private/public/readme.txt", "1.1.1.1", true).is_allowed());
    }

    #[test]
    fn test_allow_requires_all_conditions() {
        let rules = vec![allow(&["*.html"], &["/admin/*"], &["10.0.0.1"])];

        assert!(evaluate(&rules, "/admin/index.html", "10.0.0.1", true).is_allowed());
        // IP fails
        assert!(!evaluate(&rules, "/admin/index.html", "10.0.0.2", true).is_allowed());
        // extension fails
        assert!(!evaluate(&rules, "/admin/run.php", "10.0.0.1", true).is_allowed());
        // path not covered, default allow
        assert!(evaluate(&rules, "/public/run.php", "10.0.0.2", true).is_allowed());
    }

    #[test]
    fn test_deny_blocks_when_any_condition_matches() {
        let rules = vec![deny(&["*.php"], &["/*"], &["10.0.0.1"])];

        // both match
        assert!(!evaluate(&rules, "/a.php", "10.0.0.1", true).is_allowed());
        // only extension matches
        assert!(!evaluate(&rules, "/a.php", "10.0.0.9", true).is_allowed());
        // only IP matches
        assert!(!evaluate(&rules, "/a.html", "10.0.0.1", true).is_allowed());
        // neither matches
        assert!(evaluate(&rules, "/a.html", "10.0.0.9", true).is_allowed());
    }

    #[test]
    fn test_deny_path_only_rule_blocks() {
        let rules = vec![deny(&[], &["/internal/*"], &[])];
        assert!(!evaluate(&rules, "/internal/x", "1.1.1.1", true).is_allowed());
    }

    #[test]
    fn test_extension_check_can_be_disabled() {
        let rules = vec![allow(&["*.html"], &["/*"], &[])];
        assert!(!evaluate(&rules, "/run.php", "1.1.1.1", true).is_allowed());
        assert!(evaluate(&rules, "/run.php", "1.1.1.1", false).is_allowed());
    }

    #[test]
    fn test_unknown_kind_ignored() {
        let rules = parse_rules("type: Maybe\npath_access: /*\n#\ntype: Disable\nip_list: 5.5.5.5\n");
        assert_eq!(rules.len(), 2);
        assert!(matches!(rules[0].kind, RuleKind::Unknown(_)));
        assert!(evaluate(&rules, "/x", "1.1.1.1", true).is_allowed());
        assert!(!evaluate(&rules, "/x", "5.5.5.5", true).is_allowed());
    }

    #[test]
    fn test_first_decisive_rule_wins() {
        let base = vec![allow(&[], &["/*"], &["10.0.0.1"])];
        let mut extended = base.clone();
        extended.push(deny(&[], &["/*"], &[]));

        assert_eq!(
            evaluate(&base, "/page", "10.0.0.1", true),
            evaluate(&extended, "/page", "10.0.0.1", true)
        );
        assert!(evaluate(&extended, "/page", "10.0.0.1", true).is_allowed());
    }

    #[test]
    fn test_trailing_slash_patterns() {
        assert!(matches_path("/members/", "/members/"));
        assert!(!matches_path("/members/", "/members"));
        assert!(!matches_path("/members/", "/members/card.html"));
        assert!(matches_path("/members/*", "/members"));
        assert!(matches_path("/members/*", "/members/"));
        assert!(matches_path("/members/*", "/members/card.html"));

        let rules = parse_rules("type: Disable\npath_access: /members/\n");
        assert!(!evaluate(&rules, "/members/", "1.1.1.1", true).is_allowed());
        assert!(evaluate(&rules, "/members/card.html", "1.1.1.1", true).is_allowed());
    }

    #[test]
    fn test_rule_file_chain() {
        let chain = rule_file_chain(Path::new("/www/a.test"), "/docs/api/index.php");
        assert_eq!(
            chain,
            vec![
                PathBuf::from("/www/a.test/vAccess.conf"),
                PathBuf::from("/www/a.test/docs/vAccess.conf"),
                PathBuf::from("/www/a.test/docs/api/vAccess.conf"),
                PathBuf::from("/www/a.test/docs/api/index.php/vAccess.conf"),
            ]
        );
    }

    #[test]
    fn test_check_site_access_root_to_leaf() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        std::fs::write(
            dir.path().join(RULE_FILE_NAME),
            "type: Disable\npath_access: /secret/*\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("docs").join(RULE_FILE_NAME),
            "type: Disable\ntype_file: *.md\npath_access: /docs/*\nurl_error: https://example.com/\n",
        )
        .unwrap();

        assert!(!check_site_access(dir.path(), "/secret/a.txt", "1.1.1.1").is_allowed());
        assert_eq!(
            check_site_access(dir.path(), "/docs/readme.md", "1.1.1.1"),
            AccessDecision::Denied(ErrorDirective::Redirect("https://example.com/".to_string()))
        );
        assert!(check_site_access(dir.path(), "/docs/readme.txt", "1.1.1.1").is_allowed());
        assert!(check_site_access(dir.path(), "/docs/", "1.1.1.1").is_allowed());
        assert_eq!(
            rule_file_chain(dir.path(), "/docs/"),
            vec![dir.path().join(RULE_FILE_NAME), dir.path().join("docs").join(RULE_FILE_NAME)]
        );
        assert!(check_site_access(dir.path(), "/", "1.1.1.1").is_allowed());
    }

    #[test]
    fn test_check_proxy_access() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("git.example.com_vAccess.conf"),
            "type: Allow\nip_list: 127.0.0.1\npath_access: /admin/*\n",
        )
        .unwrap();

        assert!(check_proxy_access(dir.path(), "git.example.com", "/admin/x", "127.0.0.1").is_allowed());
        assert!(!check_proxy_access(dir.path(), "git.example.com", "/admin/x", "10.0.0.1").is_allowed());
        assert!(check_proxy_access(dir.path(), "other.example.com", "/admin/x", "10.0.0.1").is_allowed());
    }
}
