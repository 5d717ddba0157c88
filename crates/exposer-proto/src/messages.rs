//! Control-channel commands and payloads
//!
//! Every handshake frame is a JSON document `{"cmd": ..., "details": ...}`.
//! Payload field names follow the capitalised form used on the wire
//! (`Key`, `OK`, `Err`, `Type`, `Name`, `Attr`, `Network`, `Address`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

// Auth
pub const CMD_AUTH: &str = "auth";
pub const CMD_AUTH_REPLY: &str = "auth:reply";

// Route
pub const CMD_ROUTE: &str = "route";
pub const CMD_ROUTE_REPLY: &str = "route:reply";

// Keepalive
pub const CMD_PING: &str = "ping";
pub const CMD_PONG: &str = "pong";
pub const EVENT_TIMEOUT: &str = "event:timeout";

// Expose
pub const CMD_EXPOSE: &str = "expose";
pub const CMD_EXPOSE_REPLY: &str = "expose:reply";

// Link
pub const CMD_LINK: &str = "link";
pub const CMD_LINK_REPLY: &str = "link:reply";

// Forward
pub const CMD_FORWARD: &str = "forward";
pub const CMD_FORWARD_REPLY: &str = "forward:reply";

/// A handshake frame as read from the wire (or injected as an event)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(rename = "cmd")]
    pub command: String,
    #[serde(default)]
    pub details: Value,
}

impl Handshake {
    /// Deserialize the details into a typed payload
    pub fn details<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.details)
    }
}

/// A handshake frame to be written, borrowing its payload
#[derive(Debug, Serialize)]
pub struct OutgoingHandshake<'a, T: ?Sized> {
    #[serde(rename = "cmd")]
    pub command: &'a str,
    pub details: &'a T,
}

/// Generic `{OK, Err}` reply shared by every `*:reply` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(rename = "OK")]
    pub ok: bool,
    #[serde(rename = "Err", default)]
    pub err: String,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            ok: true,
            err: String::new(),
        }
    }

    pub fn error(reason: impl fmt::Display) -> Self {
        Self {
            ok: false,
            err: reason.to_string(),
        }
    }

    /// Convert into a result carrying the peer's error text
    pub fn into_result(self) -> Result<(), String> {
        if self.ok {
            Ok(())
        } else {
            Err(self.err)
        }
    }
}

/// Auth request payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    #[serde(rename = "Key")]
    pub key: String,
}

/// Sub-protocol selected for a logical sub-connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteType {
    Keepalive,
    Expose,
    Link,
    Forward,
}

impl RouteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteType::Keepalive => "keepalive",
            RouteType::Expose => "expose",
            RouteType::Link => "link",
            RouteType::Forward => "forward",
        }
    }
}

impl fmt::Display for RouteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a route request names an unknown sub-protocol
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0:?}: not supported type")]
pub struct UnsupportedRoute(pub String);

impl FromStr for RouteType {
    type Err = UnsupportedRoute;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keepalive" => Ok(RouteType::Keepalive),
            "expose" => Ok(RouteType::Expose),
            "link" => Ok(RouteType::Link),
            "forward" => Ok(RouteType::Forward),
            other => Err(UnsupportedRoute(other.to_string())),
        }
    }
}

/// Route request payload
///
/// The type travels as a plain string so that an unknown value can still be
/// answered with a not-OK reply instead of a decode failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRequest {
    #[serde(rename = "Type")]
    pub route_type: String,
}

impl RouteRequest {
    pub fn new(route_type: impl Into<String>) -> Self {
        Self {
            route_type: route_type.into(),
        }
    }

    pub fn parse(&self) -> Result<RouteType, UnsupportedRoute> {
        self.route_type.parse()
    }
}

/// HTTP-specific service metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpAttribute {
    #[serde(rename = "Is", default, skip_serializing_if = "is_false")]
    pub is: bool,
    #[serde(rename = "Host", default, skip_serializing_if = "String::is_empty")]
    pub host: String,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Metadata attached to an exposed service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    #[serde(rename = "HTTP", default)]
    pub http: HttpAttribute,
}

impl Attribute {
    /// Attribute of a service reachable through the HTTP gateway
    pub fn http(host: impl Into<String>) -> Self {
        Self {
            http: HttpAttribute {
                is: true,
                host: host.into(),
            },
        }
    }

    pub fn is_http(&self) -> bool {
        self.http.is
    }

    pub fn http_host(&self) -> &str {
        &self.http.host
    }
}

/// Expose request payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposeRequest {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Attr", default)]
    pub attr: Attribute,
}

/// Link request payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRequest {
    #[serde(rename = "Name")]
    pub name: String,
}

/// Forward request payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRequest {
    #[serde(rename = "Network")]
    pub network: String,
    #[serde(rename = "Address")]
    pub address: String,
}
