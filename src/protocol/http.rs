//! HTTP protocol client.

use std::time::Duration;

use reqwest::Client;
use url::Url;

use crate::config::{HostConfig, ProtocolConfig};
use crate::connector::{HttpMethod, ResultContent};

use super::{
    HttpRequest, ProtocolClient, ProtocolError, ProtocolKind, ProtocolRequest, ProtocolResponse,
    replace_macros,
};

/// HTTP client built on `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// # Errors
    /// Returns `ProtocolError::Failed` if the HTTP client cannot be built.
    pub fn new() -> Result<Self, ProtocolError> {
        let client = Client::builder()
            .build()
            .map_err(|e| ProtocolError::Failed(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

fn to_reqwest(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Options => reqwest::Method::OPTIONS,
        HttpMethod::Patch => reqwest::Method::PATCH,
    }
}

/// Resolve a declared URL. Absolute URLs are used as is; anything else is a
/// path on the host, reached with the configured scheme and port.
pub(crate) fn build_url(
    url: &str,
    host: &HostConfig,
    config: &ProtocolConfig,
) -> Result<Url, ProtocolError> {
    let lower = url.to_ascii_lowercase();
    let full = if lower.starts_with("http://") || lower.starts_with("https://") {
        url.to_string()
    } else {
        let scheme = if config.https { "https" } else { "http" };
        let port = config.port.unwrap_or(if config.https { 443 } else { 80 });
        let path = if url.starts_with('/') {
            url.to_string()
        } else {
            format!("/{}", url)
        };
        format!("{}://{}:{}{}", scheme, host.hostname, port, path)
    };
    Url::parse(&full).map_err(|e| ProtocolError::InvalidRequest(format!("invalid URL '{}': {}", full, e)))
}

/// Pick the part of the response a source asked for.
pub(crate) fn select_content(
    content: ResultContent,
    status: u16,
    headers: &str,
    body: String,
) -> String {
    match content {
        ResultContent::Body => body,
        ResultContent::Header => headers.to_string(),
        ResultContent::HttpStatus => status.to_string(),
        ResultContent::All => format!("{}\n\n{}", headers, body),
    }
}

impl HttpClient {
    async fn send(
        &self,
        request: &HttpRequest,
        host: &HostConfig,
        config: &ProtocolConfig,
        timeout: Duration,
    ) -> Result<ProtocolResponse, ProtocolError> {
        let token = request.authentication_token.as_deref();
        let url = build_url(&replace_macros(&request.url, host, Some(config), token), host, config)?;

        let mut builder = self
            .client
            .request(to_reqwest(request.method), url)
            .timeout(timeout);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), replace_macros(value, host, Some(config), token));
        }
        if let Some(body) = &request.body {
            builder = builder.body(replace_macros(body, host, Some(config), token));
        }
        if let Some(username) = &config.username {
            builder = builder.basic_auth(username, config.password.as_ref().map(|p| p.expose()));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProtocolError::Timeout(timeout)
            } else if e.is_connect() {
                ProtocolError::Unreachable(e.to_string())
            } else {
                ProtocolError::Failed(e.to_string())
            }
        })?;

        let status = response.status();
        if (status.is_client_error() || status.is_server_error())
            && request.result_content != ResultContent::HttpStatus
        {
            return Err(ProtocolError::Failed(format!("HTTP status {}", status.as_u16())));
        }

        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| format!("{}: {}", name, value.to_str().unwrap_or("")))
            .collect::<Vec<_>>()
            .join("\n");
        let body = response
            .text()
            .await
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        Ok(ProtocolResponse::Text(select_content(
            request.result_content,
            status.as_u16(),
            &headers,
            body,
        )))
    }
}

#[async_trait::async_trait]
impl ProtocolClient for HttpClient {
    async fn execute(
        &self,
        request: &ProtocolRequest,
        host: &HostConfig,
        timeout: Duration,
    ) -> Result<ProtocolResponse, ProtocolError> {
        let ProtocolRequest::Http(http) = request else {
            return Err(ProtocolError::InvalidRequest(format!(
                "HTTP client cannot execute '{}'",
                request
            )));
        };
        let config = host
            .protocol(ProtocolKind::Http)
            .ok_or(ProtocolError::NotConfigured(ProtocolKind::Http))?;
        self.send(http, host, config, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_build_url_relative_path() {
        let host = HostConfig::new("h", "bmc.example");
        let config = ProtocolConfig::default().with_https(true);
        let url = build_url("redfish/v1/Systems", &host, &config).unwrap();
        assert_eq!(url.as_str(), "https://bmc.example/redfish/v1/Systems");

        let config = ProtocolConfig::default().with_port(8080);
        let url = build_url("/status", &host, &config).unwrap();
        assert_eq!(url.as_str(), "http://bmc.example:8080/status");
    }

    #[test]
    fn test_build_url_absolute() {
        let host = HostConfig::new("h", "ignored");
        let url = build_url("HTTP://10.1.1.1:9000/api", &host, &ProtocolConfig::default()).unwrap();
        assert_eq!(url.host_str(), Some("10.1.1.1"));
        assert_eq!(url.port(), Some(9000));
    }

    #[test]
    fn test_select_content() {
        let headers = "content-type: application/json";
        assert_eq!(select_content(ResultContent::Body, 200, headers, "{}".into()), "{}");
        assert_eq!(select_content(ResultContent::HttpStatus, 404, headers, String::new()), "404");
        assert_eq!(
            select_content(ResultContent::All, 200, headers, "{}".into()),
            "content-type: application/json\n\n{}"
        );
    }

    #[tokio::test]
    async fn test_http_client_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            let body = "disk1;ok";
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });

        let host = HostConfig::new("h", "127.0.0.1").with_protocol(
            ProtocolKind::Http,
            ProtocolConfig::default().with_port(port),
        );
        let client = HttpClient::new().unwrap();
        let response = client
            .execute(
                &ProtocolRequest::Http(HttpRequest::get("/disks")),
                &host,
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(response, ProtocolResponse::Text("disk1;ok".into()));
        server.await.unwrap();
    }
}
