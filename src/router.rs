//! First-match rule selection and dispatch to a response strategy.

use std::sync::Arc;

use crate::files;
use crate::handler::Handler;
use crate::mime;
use crate::request::Request;
use crate::response::{Response, Status};
use crate::sitefile::{Action, Rule, SiteFile};

/// Accept list assumed when a request sends none.
const ACCEPT_ANY: &str = "*/*";

#[derive(Clone)]
pub struct Router {
    site: Arc<SiteFile>,
    handler: Option<Arc<dyn Handler>>,
}

impl Router {
    /// A router over `site`. `linked` rules answer 500 until
    /// [`with_handler`](Self::with_handler) supplies a handler.
    pub fn new(site: Arc<SiteFile>) -> Self {
        Self { site, handler: None }
    }

    /// Backs `linked` rules with `handler`.
    pub fn with_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn site(&self) -> &SiteFile {
        &self.site
    }

    /// The first rule that applies to `request` arriving on the port at
    /// `port_index`.
    ///
    /// # Errors
    /// - Returns `Status::BAD_REQUEST` if the request has no `Host` header
    /// - Returns `Status::INTERNAL_SERVER_ERROR` if `port_index` names no declared port
    /// - Returns `Status::NOT_FOUND` if no rule matches
    pub fn select(&self, request: &Request, port_index: usize) -> Result<&Rule, Status> {
        let host = request.headers.get("Host").ok_or(Status::BAD_REQUEST)?;
        let accept = request.headers.get("Accept").unwrap_or(ACCEPT_ANY);
        let port = self
            .site
            .ports
            .get(port_index)
            .map(|p| p.number)
            .ok_or(Status::INTERNAL_SERVER_ERROR)?;

        self.site
            .rules
            .iter()
            .find(|rule| {
                rule.method == request.method
                    && rule.host.is_match(host.as_bytes())
                    && mime::accepts(accept, &rule.content_type)
                    && rule.ports.contains(&port)
                    && rule.path.is_match(&request.path)
            })
            .ok_or(Status::NOT_FOUND)
    }

    /// Selects a rule and runs its strategy. Routing failures become the
    /// canned error page for their status.
    ///
    /// # Arguments
    /// - `request`: A complete request
    /// - `port_index`: Index of the port it arrived on
    ///
    /// # Returns
    /// - `Response`: Ready to be queued on the connection's outbox
    pub fn dispatch(&self, request: &Request, port_index: usize) -> Response {
        let rule = match self.select(request, port_index) {
            Ok(rule) => rule,
            Err(status) => {
                log::trace!("{} {} -> {}", request.method, request.path_lossy(), status);
                return Response::error(status);
            }
        };
        log::trace!(
            "{} {} matched {:?} -> {:?}",
            request.method,
            request.path_lossy(),
            rule.path.as_str(),
            rule.action
        );

        match &rule.action {
            Action::Read(target) => files::serve(target, &request.path, &rule.content_type),
            Action::Throw(status) => Response::error(*status),
            Action::Linked => match &self.handler {
                Some(handler) => handler.handle(request).into_response(&rule.content_type),
                None => {
                    log::warn!("linked rule {:?} has no handler", rule.path.as_str());
                    Response::error(Status::INTERNAL_SERVER_ERROR)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::tests::Scratch;
    use crate::handler::{HandlerResponse, Reply};
    use crate::request::{Headers, Method};
    use crate::response::Body;

    fn request(method: Method, path: &str, headers: &[(&str, &str)]) -> Request {
        let mut map = Headers::new();
        for (name, value) in headers {
            map.append(*name, *value);
        }
        Request {
            method,
            path: path.as_bytes().to_vec(),
            query: Vec::new(),
            headers: map,
            body: Vec::new(),
        }
    }

    fn get(path: &str) -> Request {
        request(Method::Get, path, &[("Host", "example.com")])
    }

    fn router(text: &str) -> Router {
        Router::new(Arc::new(SiteFile::parse(text).unwrap()))
    }

    fn bytes(response: &Response) -> &[u8] {
        match &response.body {
            Body::Bytes(b) => b,
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_missing_host_is_400() {
        let router = router("throw .* 418\n");
        let response = router.dispatch(&request(Method::Get, "/", &[]), 0);
        assert_eq!(response.status, Status::BAD_REQUEST);
    }

    #[test]
    fn test_no_match_is_404() {
        let router = router("throw /only 418\n");
        assert_eq!(router.dispatch(&get("/other"), 0).status, Status::NOT_FOUND);
    }

    #[test]
    fn test_first_match_wins() {
        let router = router("throw /a.* 410\nthrow /ab 418\n");
        assert_eq!(router.dispatch(&get("/ab"), 0).status, Status(410));
    }

    /// A rule for `/public` does not route `/public-secrets`
    #[test]
    fn test_path_must_match_fully() {
        let router = router("throw /public 410\n");
        assert_eq!(router.dispatch(&get("/public"), 0).status, Status(410));
        assert_eq!(router.dispatch(&get("/public-secrets"), 0).status, Status::NOT_FOUND);
    }

    #[test]
    fn test_method_host_and_port_filters() {
        let router = router(
            "define port 8080\ndefine port 9090\n\
             set port 9090\nthrow /p 401\nset port 8080\n\
             set host api\\.example\\.com\nthrow /h 402\n\
             set host .*\nset respondto POST\nthrow /m 403\n",
        );
        assert_eq!(router.dispatch(&get("/p"), 1).status, Status(401));
        assert_eq!(router.dispatch(&get("/p"), 0).status, Status::NOT_FOUND);

        let api = request(Method::Get, "/h", &[("Host", "api.example.com")]);
        assert_eq!(router.dispatch(&api, 0).status, Status(402));
        assert_eq!(router.dispatch(&get("/h"), 0).status, Status::NOT_FOUND);

        let post = request(Method::Post, "/m", &[("Host", "x")]);
        assert_eq!(router.dispatch(&post, 0).status, Status::FORBIDDEN);
        assert_eq!(router.dispatch(&get("/m"), 0).status, Status::NOT_FOUND);
    }

    #[test]
    fn test_accept_negotiation() {
        let router = router("set type image/png\nthrow /x 410\nset type text/html\nthrow /x 411\n");
        let png = request(Method::Get, "/x", &[("Host", "h"), ("Accept", "image/*")]);
        let html = request(Method::Get, "/x", &[("Host", "h"), ("Accept", "text/html, application/json")]);
        assert_eq!(router.dispatch(&png, 0).status, Status(410));
        assert_eq!(router.dispatch(&html, 0).status, Status(411));
        // No Accept header accepts anything.
        assert_eq!(router.dispatch(&get("/x"), 0).status, Status(410));
    }

    #[test]
    fn test_read_rule_serves_file() {
        let scratch = Scratch::new("router");
        let file = scratch.write("hello.txt", "hi");
        let router = router(&format!("set type text/plain\nread /hello \"{}\"\n", file.display()));
        let response = router.dispatch(&get("/hello"), 0);
        assert_eq!(response.status, Status::OK);
        assert_eq!(response.content_type.as_deref(), Some("text/plain"));
        assert!(matches!(response.body, Body::Sized { len: 2, .. }));
    }

    #[test]
    fn test_linked_rules() {
        let site = Arc::new(SiteFile::parse("set type application/json\nlinked /api/.*\n").unwrap());
        let unlinked = Router::new(site.clone());
        assert_eq!(unlinked.dispatch(&get("/api/x"), 0).status, Status::INTERNAL_SERVER_ERROR);

        let echo = |req: &Request| HandlerResponse::new(200, Reply::Buffer(req.path.clone()));
        let linked = Router::new(site).with_handler(Arc::new(echo));
        let response = linked.dispatch(&get("/api/x"), 0);
        assert_eq!(response.status, Status::OK);
        assert_eq!(response.content_type.as_deref(), Some("application/json"));
        assert_eq!(bytes(&response), b"/api/x");
    }
}
