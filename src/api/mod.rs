pub mod live;
pub mod traffic;

use serde::Serialize;
use std::collections::HashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Error envelope for failed requests; successful endpoints return their
/// own JSON shapes directly.
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query_params: HashMap<String, String>,
}

impl HttpRequest {
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query_params.get(key).map(|s| s.as_str())
    }
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

impl HttpResponse {
    pub fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(body) => Self {
                status: 200,
                content_type: "application/json".to_string(),
                body,
            },
            Err(e) => Self::error(500, format!("JSON serialization failed: {}", e)),
        }
    }

    pub fn text(body: String) -> Self {
        Self {
            status: 200,
            content_type: "text/plain".to_string(),
            body,
        }
    }

    pub fn error(status: u16, message: String) -> Self {
        let body = serde_json::to_string(&ErrorResponse { error: message })
            .unwrap_or_else(|_| r#"{"error":"internal error"}"#.to_string());
        Self {
            status,
            content_type: "application/json".to_string(),
            body,
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::error(400, message.to_string())
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            content_type: "text/plain".to_string(),
            body: "Not Found".to_string(),
        }
    }

    pub fn method_not_allowed() -> Self {
        Self::error(405, "Method not allowed".to_string())
    }
}

/// Per-module API handlers. Traffic serves the persisted history, Live
/// serves capture-side state that never touches the database.
#[derive(Clone)]
pub enum ApiHandler {
    Traffic(traffic::TrafficApiHandler),
    Live(live::LiveApiHandler),
}

impl ApiHandler {
    pub fn supported_routes(&self) -> Vec<&'static str> {
        match self {
            ApiHandler::Traffic(handler) => handler.supported_routes(),
            ApiHandler::Live(handler) => handler.supported_routes(),
        }
    }

    pub async fn handle_request(
        &self,
        request: &HttpRequest,
    ) -> Result<HttpResponse, anyhow::Error> {
        match self {
            ApiHandler::Traffic(handler) => handler.handle_request(request).await,
            ApiHandler::Live(handler) => handler.handle_request(request).await,
        }
    }
}

#[derive(Clone)]
pub struct ApiRouter {
    handlers: Vec<ApiHandler>,
}

impl ApiRouter {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register_handler(&mut self, handler: ApiHandler) {
        self.handlers.push(handler);
    }

    pub async fn route_request(
        &self,
        request: &HttpRequest,
    ) -> Result<HttpResponse, anyhow::Error> {
        if request.path == "/" {
            return Ok(HttpResponse::text(
                "netsentinel traffic meter; query surface lives under /api".to_string(),
            ));
        }
        for handler in &self.handlers {
            for route in handler.supported_routes() {
                if request.path.starts_with(route) {
                    return handler.handle_request(request).await;
                }
            }
        }
        Ok(HttpResponse::not_found())
    }
}

/// Minimal request-line parser: method, path, query string. Headers and
/// bodies are irrelevant to this API surface.
pub fn parse_http_request(request_bytes: &[u8]) -> Result<HttpRequest, anyhow::Error> {
    let request_str = String::from_utf8_lossy(request_bytes);
    let first_line = request_str
        .lines()
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty request"))?;

    let mut parts = first_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("missing method"))?
        .to_string();
    let path_with_query = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("missing request path"))?;

    let (path, query_str) = match path_with_query.split_once('?') {
        Some((p, q)) => (p.to_string(), Some(q)),
        None => (path_with_query.to_string(), None),
    };

    let mut query_params = HashMap::new();
    if let Some(query) = query_str {
        for param in query.split('&') {
            if let Some((key, value)) = param.split_once('=') {
                query_params.insert(key.to_string(), value.to_string());
            }
        }
    }

    Ok(HttpRequest {
        method,
        path,
        query_params,
    })
}

pub async fn send_http_response(
    stream: &mut TcpStream,
    response: &HttpResponse,
) -> Result<(), anyhow::Error> {
    let status_text = match response.status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "Unknown",
    };

    let http_response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        response.status,
        status_text,
        response.content_type,
        response.body.len(),
        response.body
    );

    stream.write_all(http_response.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_line_with_query() {
        let raw = b"GET /api/query?start=2024-06-01&end=2024-06-30&granularity=day HTTP/1.1\r\nHost: nas\r\n\r\n";
        let req = parse_http_request(raw).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/api/query");
        assert_eq!(req.query("start"), Some("2024-06-01"));
        assert_eq!(req.query("end"), Some("2024-06-30"));
        assert_eq!(req.query("granularity"), Some("day"));
        assert_eq!(req.query("missing"), None);
    }

    #[test]
    fn test_parse_request_without_query() {
        let req = parse_http_request(b"GET /api/health HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.path, "/api/health");
        assert!(req.query_params.is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_http_request(b"").is_err());
        assert!(parse_http_request(b"GET\r\n").is_err());
    }
}
