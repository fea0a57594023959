//! Adapting axum requests to [`GateRequest`].
//!
//! The gate only needs the method, headers and who is calling, so the
//! middleware takes an owned snapshot of those before the request moves on
//! to the next handler.

use axum::extract::{ConnectInfo, Request};
use axum::http::HeaderMap;
use std::net::{IpAddr, SocketAddr};
use tollgate_guard::GateRequest;

/// Authenticated caller identity, inserted into request extensions by the
/// host's auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerId(pub String);

impl CallerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Owned view of the parts of an HTTP request the gate consults.
#[derive(Debug, Clone)]
pub struct HttpGateRequest {
    method: String,
    headers: HeaderMap,
    caller: Option<String>,
    ip: Option<IpAddr>,
}

impl HttpGateRequest {
    pub fn from_request(request: &Request) -> Self {
        let connect = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        Self {
            method: request.method().as_str().to_string(),
            headers: request.headers().clone(),
            caller: request
                .extensions()
                .get::<CallerId>()
                .map(|caller| caller.0.clone()),
            ip: extract_client_ip(request.headers(), connect),
        }
    }
}

impl GateRequest for HttpGateRequest {
    fn method(&self) -> &str {
        &self.method
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    fn caller_id(&self) -> Option<String> {
        self.caller.clone()
    }

    fn client_ip(&self) -> Option<IpAddr> {
        self.ip
    }
}

/// Extract client IP from request headers, considering proxy headers.
///
/// Order: first `X-Forwarded-For` entry, then `X-Real-IP`, then the
/// connection address when the server was started with connect info.
pub fn extract_client_ip(headers: &HeaderMap, fallback: Option<SocketAddr>) -> Option<IpAddr> {
    // X-Forwarded-For can contain multiple IPs, take the first one
    if let Some(forwarded_for) = headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
    {
        if let Some(first_ip) = forwarded_for.split(',').next() {
            if let Ok(ip) = first_ip.trim().parse() {
                return Some(ip);
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|h| h.to_str().ok()) {
        if let Ok(ip) = real_ip.trim().parse() {
            return Some(ip);
        }
    }

    fallback.map(|addr| addr.ip())
}
