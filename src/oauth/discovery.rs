//! Authorization endpoint discovery
//!
//! Before a browser flow can run, the broker must know the remote's
//! authorization and token endpoints. The discovery sequence:
//!
//! 1. `GET <serverUrl>` with `Accept: application/json` and no auth.
//! 2. A `401` response may carry `WWW-Authenticate: Bearer
//!    resource_metadata="<url>"`; fetch that URL.
//! 3. The protected-resource metadata lists authorization servers; take the
//!    first one.
//! 4. `GET <authorization_server>/.well-known/oauth-authorization-server`
//!    yields the endpoint pair (and, when advertised, the dynamic client
//!    registration endpoint).
//!
//! Discovery never fails the connection on its own. Every failure along
//! the chain falls back to `<origin>/oauth/authorize` and
//! `<origin>/oauth/token`; if those are wrong the subsequent token
//! exchange fails and the caller deals with it.

use std::collections::HashMap;

use serde::Deserialize;
use url::Url;

// ---------------------------------------------------------------------------
// OAuthEndpoints
// ---------------------------------------------------------------------------

/// The endpoints the authorization flows operate against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthEndpoints {
    /// Where the user's browser is sent to approve the authorization.
    pub authorization_endpoint: Url,
    /// Where authorization codes and refresh tokens are exchanged.
    pub token_endpoint: Url,
    /// Dynamic client registration endpoint, when the server advertises one.
    pub registration_endpoint: Option<Url>,
}

/// Protected-resource metadata (RFC 9728), reduced to the field discovery
/// consumes.
#[derive(Debug, Deserialize)]
struct ProtectedResourceMetadata {
    authorization_servers: Vec<String>,
}

/// Authorization-server metadata (RFC 8414), reduced to the fields
/// discovery consumes.
#[derive(Debug, Deserialize)]
struct AuthorizationServerMetadata {
    authorization_endpoint: String,
    token_endpoint: String,
    #[serde(default)]
    registration_endpoint: Option<String>,
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Determines the authorization endpoints for `server_url`.
///
/// Follows the metadata chain described in the module docs; any failure
/// falls back to [`fallback_endpoints`]. This function therefore never
/// returns an error.
///
/// # Arguments
///
/// * `http` - Shared HTTP client.
/// * `server_url` - The remote MCP server URL.
/// * `headers` - Caller-supplied headers included on every discovery
///   request (no `Authorization` is injected).
pub async fn discover(
    http: &reqwest::Client,
    server_url: &Url,
    headers: &HashMap<String, String>,
) -> OAuthEndpoints {
    match try_discover(http, server_url, headers).await {
        Some(endpoints) => endpoints,
        None => {
            let fallback = fallback_endpoints(server_url);
            tracing::debug!(
                "endpoint discovery failed; falling back to {} / {}",
                fallback.authorization_endpoint,
                fallback.token_endpoint
            );
            fallback
        }
    }
}

/// The always-usable fallback: `<origin>/oauth/authorize` and
/// `<origin>/oauth/token`.
pub fn fallback_endpoints(server_url: &Url) -> OAuthEndpoints {
    let origin = server_url.origin().ascii_serialization();
    let authorization_endpoint = Url::parse(&format!("{origin}/oauth/authorize"))
        .expect("origin-derived URL is always valid");
    let token_endpoint =
        Url::parse(&format!("{origin}/oauth/token")).expect("origin-derived URL is always valid");
    OAuthEndpoints {
        authorization_endpoint,
        token_endpoint,
        registration_endpoint: None,
    }
}

/// The fallible discovery chain; `None` means "use the fallback".
async fn try_discover(
    http: &reqwest::Client,
    server_url: &Url,
    headers: &HashMap<String, String>,
) -> Option<OAuthEndpoints> {
    // Step 1: unauthenticated probe of the server itself.
    let mut req = http
        .get(server_url.as_str())
        .header("Accept", "application/json");
    for (name, value) in headers {
        req = req.header(name.as_str(), value.as_str());
    }
    let response = req.send().await.ok()?;

    // Step 2: a 401 may point at the protected-resource metadata document.
    if response.status() != reqwest::StatusCode::UNAUTHORIZED {
        return None;
    }
    let www_authenticate = response
        .headers()
        .get(reqwest::header::WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())?;
    let metadata_url = parse_resource_metadata_url(www_authenticate)?;

    // Step 3: protected-resource metadata lists the authorization servers.
    let resource_meta: ProtectedResourceMetadata = http
        .get(&metadata_url)
        .send()
        .await
        .ok()?
        .error_for_status()
        .ok()?
        .json()
        .await
        .ok()?;
    let auth_server = resource_meta.authorization_servers.first()?;

    // Step 4: authorization-server metadata carries the endpoint pair.
    let well_known = format!(
        "{}/.well-known/oauth-authorization-server",
        auth_server.trim_end_matches('/')
    );
    let server_meta: AuthorizationServerMetadata = http
        .get(&well_known)
        .send()
        .await
        .ok()?
        .error_for_status()
        .ok()?
        .json()
        .await
        .ok()?;

    Some(OAuthEndpoints {
        authorization_endpoint: Url::parse(&server_meta.authorization_endpoint).ok()?,
        token_endpoint: Url::parse(&server_meta.token_endpoint).ok()?,
        registration_endpoint: server_meta
            .registration_endpoint
            .as_deref()
            .and_then(|u| Url::parse(u).ok()),
    })
}

/// Extracts the `resource_metadata` attribute from a `WWW-Authenticate:
/// Bearer` challenge.
///
/// Handles both the quoted (`resource_metadata="<url>"`) and unquoted
/// forms. Returns `None` when the attribute is absent.
pub fn parse_resource_metadata_url(www_authenticate: &str) -> Option<String> {
    let key = "resource_metadata=";
    let pos = www_authenticate.find(key)?;
    let rest = &www_authenticate[pos + key.len()..];

    if let Some(inner) = rest.strip_prefix('"') {
        let end = inner.find('"')?;
        Some(inner[..end].to_string())
    } else {
        let end = rest
            .find(|c: char| c.is_whitespace() || c == ',')
            .unwrap_or(rest.len());
        Some(rest[..end].to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
