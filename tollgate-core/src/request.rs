//! The abstract incoming request seen by the guard.
//!
//! Hosts adapt their own request type to [`GateRequest`]; the guard only
//! needs the method, header lookup and who the caller is.

use std::net::IpAddr;

/// Read-only view of an incoming request.
pub trait GateRequest: Send + Sync {
    /// HTTP method, e.g. `"POST"`.
    fn method(&self) -> &str;

    /// Look up a header by name. Lookups are case-insensitive.
    fn header(&self, name: &str) -> Option<&str>;

    /// Authenticated caller identity, if any.
    fn caller_id(&self) -> Option<String>;

    /// Client address, after any trusted proxy headers were applied.
    fn client_ip(&self) -> Option<IpAddr>;
}

impl<T: GateRequest + ?Sized> GateRequest for &T {
    fn method(&self) -> &str {
        (**self).method()
    }

    fn header(&self, name: &str) -> Option<&str> {
        (**self).header(name)
    }

    fn caller_id(&self) -> Option<String> {
        (**self).caller_id()
    }

    fn client_ip(&self) -> Option<IpAddr> {
        (**self).client_ip()
    }
}
