//! Administrative API client
//!
//! Lists, deletes and inspects tunnels through the broker's authenticated
//! HTTP API. Independent of any running relay session.

use std::collections::HashMap;

use outpost_shared::protocol::Protocol;
use outpost_shared::{Error, Result};
use reqwest::{header, Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A tunnel as reported by the admin API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub id: String,
    pub subdomain: String,
    pub public_url: String,
    pub protocol: Protocol,
    pub status: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Traffic statistics for one tunnel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelStats {
    pub tunnel_id: String,
    #[serde(default)]
    pub bytes_sent: u64,
    #[serde(default)]
    pub bytes_recv: u64,
    #[serde(default)]
    pub requests: u64,
    /// Broker-specific counters
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(alias = "message")]
    error: String,
}

pub struct AdminClient {
    http: reqwest::Client,
    base: Url,
    token: String,
}

impl AdminClient {
    /// `api_url` may be given in its ws(s) form; it is mapped onto http(s).
    pub fn new(api_url: &str, token: impl Into<String>) -> Result<Self> {
        let mut base = Url::parse(api_url.trim())
            .map_err(|e| Error::Config(format!("invalid API URL '{}': {}", api_url, e)))?;
        let scheme = match base.scheme() {
            "https" | "wss" => "https",
            "http" | "ws" => "http",
            other => return Err(Error::Config(format!("unsupported API URL scheme '{}'", other))),
        };
        base.set_scheme(scheme)
            .map_err(|_| Error::Config(format!("cannot use '{}' as an API URL", api_url)))?;
        base.set_path("");
        base.set_query(None);

        let http = reqwest::Client::builder()
            .user_agent(concat!("outpost/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base,
            token: token.into(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub async fn list_tunnels(&self) -> Result<Vec<TunnelRecord>> {
        let response = self.send(self.request(Method::GET, &["api", "tunnels"])?).await?;
        json(response).await
    }

    pub async fn delete_tunnel(&self, tunnel_id: &str) -> Result<()> {
        self.send(self.request(Method::DELETE, &["api", "tunnels", tunnel_id])?)
            .await?;
        Ok(())
    }

    pub async fn get_tunnel_stats(&self, tunnel_id: &str) -> Result<TunnelStats> {
        let response = self
            .send(self.request(Method::GET, &["api", "tunnels", tunnel_id, "stats"])?)
            .await?;
        json(response).await
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("API URL {} cannot take a path", self.base)))?
            .clear()
            .extend(segments);

        debug!("{} {}", method, url);
        let mut builder = self.http.request(method, url);
        if !self.token.is_empty() {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", self.token));
        }
        Ok(builder)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| Error::Connect(format!("admin API request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or_else(|_| {
                if body.trim().is_empty() {
                    status.canonical_reason().unwrap_or("request failed").to_string()
                } else {
                    body.trim().to_string()
                }
            });
        Err(Error::Api {
            status: status.as_u16(),
            message,
        })
    }
}

async fn json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| Error::Connect(format!("failed to read admin API response: {}", e)))?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{delete, get};
    use axum::{Json, Router};

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            == Some("Bearer secret")
    }

    async fn fake_api() -> String {
        let app = Router::new()
            .route(
                "/api/tunnels",
                get(|headers: HeaderMap| async move {
                    if !authorized(&headers) {
                        return Err((StatusCode::UNAUTHORIZED, Json(serde_json::json!({"error": "invalid token"}))));
                    }
                    Ok(Json(serde_json::json!([{
                        "id": "t1",
                        "subdomain": "myapp",
                        "public_url": "https://myapp.example.com",
                        "protocol": "http",
                        "status": "active"
                    }])))
                }),
            )
            .route(
                "/api/tunnels/:id",
                delete(|Path(id): Path<String>| async move {
                    if id == "t1" {
                        StatusCode::NO_CONTENT
                    } else {
                        StatusCode::NOT_FOUND
                    }
                }),
            )
            .route(
                "/api/tunnels/:id/stats",
                get(|Path(id): Path<String>| async move {
                    Json(serde_json::json!({
                        "tunnel_id": id,
                        "bytes_sent": 10,
                        "bytes_recv": 20,
                        "requests": 3,
                        "active_connections": 1
                    }))
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_ws_url_maps_to_http() {
        let client = AdminClient::new("wss://tunnel.example.com/tunnel", "").unwrap();
        assert_eq!(client.base_url().as_str(), "https://tunnel.example.com/");
        assert!(AdminClient::new("ftp://tunnel.example.com", "").is_err());
    }

    #[tokio::test]
    async fn test_list_tunnels() {
        let client = AdminClient::new(&fake_api().await, "secret").unwrap();
        let tunnels = client.list_tunnels().await.unwrap();
        assert_eq!(tunnels.len(), 1);
        assert_eq!(tunnels[0].id, "t1");
        assert_eq!(tunnels[0].protocol, Protocol::Http);
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_api_error() {
        let client = AdminClient::new(&fake_api().await, "wrong").unwrap();
        match client.list_tunnels().await {
            Err(Error::Api { status, message }) => {
                assert_eq!(status, 401);
                assert_eq!(message, "invalid token");
            }
            other => panic!("expected API error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_and_stats() {
        let client = AdminClient::new(&fake_api().await, "secret").unwrap();
        client.delete_tunnel("t1").await.unwrap();
        assert!(matches!(
            client.delete_tunnel("nope").await,
            Err(Error::Api { status: 404, .. })
        ));

        let stats = client.get_tunnel_stats("t1").await.unwrap();
        assert_eq!(stats.tunnel_id, "t1");
        assert_eq!(stats.bytes_sent, 10);
        assert_eq!(stats.bytes_recv, 20);
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.extra.get("active_connections"), Some(&serde_json::json!(1)));
    }
}
