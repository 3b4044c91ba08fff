//! The site description: ordered routing rules plus per-port declarations.
//!
//! A sitefile is a line-oriented command file:
//!
//! ```text
//! # ports
//! define port 8080
//! define timeout 2000
//! define port 8443
//! define transport tls
//! define key /etc/hearth/key.pem
//! define cert /etc/hearth/cert.pem
//!
//! # rules, first match wins
//! set host (www\\.)?example\\.com
//! set type text/plain
//! read /hello /srv/site/hello.txt
//! set type text/html
//! read /public/.* /srv/site
//! set respondto POST
//! linked /api/.*
//! throw .* 404
//! ```
//!
//! `set` directives change the filters applied to every following rule;
//! `define` directives describe the most recently declared port.

use std::fs;
use std::path::{Path, PathBuf};

use regex::bytes::Regex;

use crate::error::SiteFileError;
use crate::request::Method;
use crate::response::Status;

/// Port used when a sitefile declares none.
pub const DEFAULT_PORT: u16 = 80;

/// A pattern that must span the whole subject, not just a substring of it.
#[derive(Debug, Clone)]
pub struct FullMatch {
    source: String,
    regex: Regex,
}

impl FullMatch {
    /// Compiles `pattern` anchored at both ends.
    ///
    /// # Errors
    /// - Returns the `regex` error if `pattern` does not compile
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            source: pattern.to_owned(),
            regex: Regex::new(&format!(r"\A(?:{})\z", pattern))?,
        })
    }

    pub fn is_match(&self, subject: &[u8]) -> bool {
        self.regex.is_match(subject)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Tls,
}

/// A listening port and how connections on it are handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDecl {
    pub number: u16,
    pub transport: TransportKind,
    pub key: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    /// Idle timeout in milliseconds; 0 disables it.
    pub timeout_ms: u64,
}

impl PortDecl {
    pub fn tcp(number: u16) -> Self {
        Self {
            number,
            transport: TransportKind::Tcp,
            key: None,
            cert: None,
            timeout_ms: 0,
        }
    }
}

/// What a matching rule does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Serve a file, or a file below a directory.
    Read(PathBuf),
    /// Emit the canned page for a status.
    Throw(Status),
    /// Delegate to the configured [`Handler`](crate::handler::Handler).
    Linked,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub method: Method,
    pub host: FullMatch,
    pub content_type: String,
    pub path: FullMatch,
    pub ports: Vec<u16>,
    pub action: Action,
}

/// Program configured with `define handler`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// The parsed site. Read-only once loaded and shared by every worker.
#[derive(Debug, Clone, Default)]
pub struct SiteFile {
    pub rules: Vec<Rule>,
    pub ports: Vec<PortDecl>,
    pub handler: Option<HandlerCommand>,
}

impl SiteFile {
    /// Reads and parses the sitefile at `path`.
    ///
    /// # Errors
    /// - Returns `SiteFileError::Read` if the file cannot be read
    /// - Returns any error [`parse`](Self::parse) reports
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SiteFileError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| SiteFileError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parses and validates sitefile text.
    ///
    /// If no port is declared a single TCP port 80 is implied.
    ///
    /// # Errors
    /// - Returns a `SiteFileError` carrying the 1-based line number for an
    ///   unknown directive, an invalid regex or status code, a TLS port
    ///   without key or cert, or a rule naming an undeclared port
    pub fn parse(text: &str) -> Result<Self, SiteFileError> {
        Builder::new()?.parse(text)
    }

    /// Index of the declaration for `number`.
    pub fn port_index(&self, number: u16) -> Option<usize> {
        self.ports.iter().position(|p| p.number == number)
    }

    /// The smallest non-zero idle timeout across all ports.
    pub fn min_timeout_ms(&self) -> Option<u64> {
        self.ports
            .iter()
            .map(|p| p.timeout_ms)
            .filter(|&t| t > 0)
            .min()
    }
}

/// Filters applied to rules as they are declared.
struct Filters {
    method: Method,
    host: FullMatch,
    content_type: String,
    ports: Option<Vec<u16>>,
}

struct Builder {
    site: SiteFile,
    filters: Filters,
    /// Rules whose port set defaults to "every declared port".
    open_rules: Vec<usize>,
    /// (rule index, line) pairs to validate against the declared ports.
    rule_lines: Vec<(usize, usize)>,
}

impl Builder {
    fn new() -> Result<Self, SiteFileError> {
        Ok(Self {
            site: SiteFile::default(),
            filters: Filters {
                method: Method::Get,
                host: compile(0, ".*")?,
                content_type: "text/html".to_owned(),
                ports: None,
            },
            open_rules: Vec::new(),
            rule_lines: Vec::new(),
        })
    }

    fn parse(mut self, text: &str) -> Result<SiteFile, SiteFileError> {
        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let tokens = tokenize(raw).map_err(|message| SiteFileError::syntax(line, message))?;
            if tokens.is_empty() {
                continue;
            }
            self.directive(line, &tokens)?;
        }
        self.finish()
    }

    fn directive(&mut self, line: usize, tokens: &[String]) -> Result<(), SiteFileError> {
        let args: Vec<&str> = tokens.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["define", "port", number] => {
                let number = parse_port(line, number)?;
                if self.site.port_index(number).is_some() {
                    return Err(SiteFileError::syntax(line, format!("port {} declared twice", number)));
                }
                self.site.ports.push(PortDecl::tcp(number));
            }
            ["define", "transport", kind] => {
                let transport = match kind.to_ascii_lowercase().as_str() {
                    "tcp" => TransportKind::Tcp,
                    "tls" => TransportKind::Tls,
                    _ => return Err(SiteFileError::syntax(line, format!("unknown transport {:?}", kind))),
                };
                self.current_port(line)?.transport = transport;
            }
            ["define", "key", path] => self.current_port(line)?.key = Some(PathBuf::from(path)),
            ["define", "cert", path] => self.current_port(line)?.cert = Some(PathBuf::from(path)),
            ["define", "timeout", ms] => {
                let ms = ms
                    .parse()
                    .map_err(|_| SiteFileError::syntax(line, format!("invalid timeout {:?}", ms)))?;
                self.current_port(line)?.timeout_ms = ms;
            }
            ["define", "handler", program, rest @ ..] => {
                self.site.handler = Some(HandlerCommand {
                    program: PathBuf::from(program),
                    args: rest.iter().map(|s| s.to_string()).collect(),
                });
            }
            ["set", "respondto", method] => {
                self.filters.method = method
                    .parse()
                    .map_err(|_| SiteFileError::syntax(line, format!("unknown method {:?}", method)))?;
            }
            ["set", "host", pattern] => self.filters.host = compile(line, pattern)?,
            ["set", "type", content_type] => self.filters.content_type = content_type.to_string(),
            ["set", "port", list] => {
                let ports = list
                    .split(',')
                    .map(|p| parse_port(line, p.trim()))
                    .collect::<Result<Vec<_>, _>>()?;
                self.filters.ports = Some(ports);
            }
            ["read", path, target] => self.rule(line, path, Action::Read(PathBuf::from(target)))?,
            ["throw", path, code] => {
                let status = code
                    .parse::<u16>()
                    .ok()
                    .filter(|c| (100..=599).contains(c))
                    .map(Status)
                    .ok_or_else(|| SiteFileError::syntax(line, format!("invalid status code {:?}", code)))?;
                self.rule(line, path, Action::Throw(status))?;
            }
            ["linked", path] => self.rule(line, path, Action::Linked)?,
            [command, ..] => {
                return Err(SiteFileError::syntax(
                    line,
                    format!("unknown or malformed directive {:?}", command),
                ))
            }
            [] => {}
        }
        Ok(())
    }

    fn current_port(&mut self, line: usize) -> Result<&mut PortDecl, SiteFileError> {
        self.site
            .ports
            .last_mut()
            .ok_or_else(|| SiteFileError::syntax(line, "no port declared yet"))
    }

    fn rule(&mut self, line: usize, path: &str, action: Action) -> Result<(), SiteFileError> {
        let index = self.site.rules.len();
        let ports = match &self.filters.ports {
            Some(ports) => ports.clone(),
            None => {
                self.open_rules.push(index);
                Vec::new()
            }
        };
        self.site.rules.push(Rule {
            method: self.filters.method,
            host: self.filters.host.clone(),
            content_type: self.filters.content_type.clone(),
            path: compile(line, path)?,
            ports,
            action,
        });
        self.rule_lines.push((index, line));
        Ok(())
    }

    fn finish(mut self) -> Result<SiteFile, SiteFileError> {
        if self.site.ports.is_empty() {
            self.site.ports.push(PortDecl::tcp(DEFAULT_PORT));
        }

        let declared: Vec<u16> = self.site.ports.iter().map(|p| p.number).collect();
        for index in self.open_rules {
            self.site.rules[index].ports = declared.clone();
        }
        for (index, line) in self.rule_lines {
            if let Some(port) = self.site.rules[index].ports.iter().find(|p| !declared.contains(p)) {
                return Err(SiteFileError::syntax(line, format!("rule uses undeclared port {}", port)));
            }
        }

        for port in &self.site.ports {
            if port.transport == TransportKind::Tls {
                if port.key.is_none() {
                    return Err(SiteFileError::MissingCredential { port: port.number, missing: "key" });
                }
                if port.cert.is_none() {
                    return Err(SiteFileError::MissingCredential { port: port.number, missing: "cert" });
                }
            }
        }

        Ok(self.site)
    }
}

fn compile(line: usize, pattern: &str) -> Result<FullMatch, SiteFileError> {
    FullMatch::new(pattern).map_err(|source| SiteFileError::Pattern {
        line,
        pattern: pattern.to_owned(),
        source,
    })
}

fn parse_port(line: usize, text: &str) -> Result<u16, SiteFileError> {
    text.parse()
        .map_err(|_| SiteFileError::syntax(line, format!("invalid port {:?}", text)))
}

/// Splits a line into tokens. `"..."` groups whitespace, `\` escapes the
/// next character and `#` starts a comment.
fn tokenize(line: &str) -> Result<Vec<String>, &'static str> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let quoted = match chars.peek() {
            None | Some('#') => break,
            Some('"') => {
                chars.next();
                true
            }
            Some(_) => false,
        };

        let mut token = String::new();
        loop {
            match chars.next() {
                None if quoted => return Err("unterminated quote"),
                None => break,
                Some('"') if quoted => break,
                Some(c) if !quoted && c.is_whitespace() => break,
                Some('\\') => token.push(chars.next().ok_or("dangling escape")?),
                Some(c) => token.push(c),
            }
        }
        tokens.push(token);
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SITE: &str = r#"
# two ports
define port 8080
define timeout 2000
define port 8443
define transport tls
define key /tmp/key.pem
define cert /tmp/cert.pem
define handler /usr/bin/env "page handler"

set host (www\\.)?example\\.com
set type text/plain
read /hello /srv/site/hello.txt
set type text/html
set port 8443
read /public/.* /srv/site
set respondto POST
linked /api/.*
throw .* 404
"#;

    #[test]
    fn test_parse_full_site() {
        let site = SiteFile::parse(SITE).unwrap();
        assert_eq!(site.ports.len(), 2);
        assert_eq!(site.ports[0], PortDecl { timeout_ms: 2000, ..PortDecl::tcp(8080) });
        assert_eq!(site.ports[1].transport, TransportKind::Tls);
        assert_eq!(site.ports[1].cert.as_deref(), Some(Path::new("/tmp/cert.pem")));
        assert_eq!(
            site.handler,
            Some(HandlerCommand {
                program: PathBuf::from("/usr/bin/env"),
                args: vec!["page handler".to_owned()],
            })
        );

        assert_eq!(site.rules.len(), 4);
        let hello = &site.rules[0];
        assert_eq!(hello.method, Method::Get);
        assert_eq!(hello.content_type, "text/plain");
        assert_eq!(hello.ports, vec![8080, 8443]);
        assert_eq!(hello.action, Action::Read(PathBuf::from("/srv/site/hello.txt")));
        assert!(hello.host.is_match(b"www.example.com"));
        assert!(!hello.host.is_match(b"evil.com"));

        assert_eq!(site.rules[1].ports, vec![8443]);
        assert_eq!(site.rules[2].method, Method::Post);
        assert_eq!(site.rules[2].action, Action::Linked);
        assert_eq!(site.rules[3].action, Action::Throw(Status::NOT_FOUND));
        assert_eq!(site.min_timeout_ms(), Some(2000));
    }

    /// `/public` must not route `/public-secrets`
    #[test]
    fn test_patterns_are_full_matches() {
        let pattern = FullMatch::new("/public").unwrap();
        assert!(pattern.is_match(b"/public"));
        assert!(!pattern.is_match(b"/public-secrets"));
        assert!(!pattern.is_match(b"/x/public"));

        let wildcard = FullMatch::new("/public/.*").unwrap();
        assert!(wildcard.is_match(b"/public/a/b.css"));
        assert!(!wildcard.is_match(b"/publicity"));

        let alternation = FullMatch::new("a|ab").unwrap();
        assert!(alternation.is_match(b"ab"));
    }

    #[test]
    fn test_default_port_and_filters() {
        let site = SiteFile::parse("read / /srv/index.html\n").unwrap();
        assert_eq!(site.ports, vec![PortDecl::tcp(DEFAULT_PORT)]);
        let rule = &site.rules[0];
        assert_eq!(rule.ports, vec![DEFAULT_PORT]);
        assert_eq!(rule.method, Method::Get);
        assert!(rule.host.is_match(b"anything"));
        assert_eq!(rule.content_type, "text/html");
        assert_eq!(site.min_timeout_ms(), None);
    }

    #[test]
    fn test_tls_requires_credentials() {
        let err = SiteFile::parse("define port 443\ndefine transport tls\ndefine cert c.pem\n").unwrap_err();
        assert!(matches!(err, SiteFileError::MissingCredential { port: 443, missing: "key" }));
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        let err = SiteFile::parse("define port 80\n\nserve / x\n").unwrap_err();
        assert!(matches!(err, SiteFileError::Syntax { line: 3, .. }));

        let err = SiteFile::parse("read ( /srv\n").unwrap_err();
        assert!(matches!(err, SiteFileError::Pattern { line: 1, .. }));

        let err = SiteFile::parse("throw .* 999\n").unwrap_err();
        assert!(matches!(err, SiteFileError::Syntax { line: 1, .. }));

        let err = SiteFile::parse("define timeout 5\n").unwrap_err();
        assert!(matches!(err, SiteFileError::Syntax { line: 1, .. }));

        let err = SiteFile::parse("define port 80\nset port 81\nread / x\n").unwrap_err();
        assert!(matches!(err, SiteFileError::Syntax { line: 3, .. }));
    }

    #[test]
    fn test_tokenizer() {
        assert_eq!(tokenize("  a  b\tc # note").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(tokenize(r#"read "/with space" x\ y"#).unwrap(), vec!["read", "/with space", "x y"]);
        assert_eq!(tokenize(r#"a\#b"#).unwrap(), vec!["a#b"]);
        assert_eq!(tokenize("# only a comment").unwrap(), Vec::<String>::new());
        assert!(tokenize(r#"read "open"#).is_err());
    }
}
