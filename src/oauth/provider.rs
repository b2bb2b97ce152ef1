//! Authorization-code providers: classical and PKCE
//!
//! Two flows obtain tokens for the remote server, chosen by configuration:
//!
//! - **Classical**: a pre-registered confidential client
//!   (`--static-oauth-client-info` supplies `client_id` and optionally
//!   `client_secret`). No PKCE parameters are sent.
//! - **PKCE**: a public client with an S256 code challenge. The client is
//!   registered dynamically (RFC 7591) on first use and the registration is
//!   persisted for later runs.
//!
//! Both providers persist their state through the credential store: the
//! token bundle, the registered client (PKCE), and the ephemeral code
//! verifier (PKCE, consumed by the exchange and deleted afterwards).
//!
//! The `state` parameter is generated once per provider instance and sent
//! unchanged; the callback's echoed value is verified and a mismatch fails
//! the exchange.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{McpRemoteError, Result};
use crate::oauth::callback::{AuthCode, CallbackServer};
use crate::oauth::discovery::OAuthEndpoints;
use crate::oauth::pkce;
use crate::store::{CredentialStore, CLIENT_INFO_FILE, CODE_VERIFIER_FILE, TOKENS_FILE};

// ---------------------------------------------------------------------------
// TokenBundle
// ---------------------------------------------------------------------------

/// The persisted token endpoint response.
///
/// `expires_in` is kept verbatim as seconds remaining: absent means
/// non-expiring, a value `<= 0` means expired. A non-numeric value is
/// logged and treated as absent -- the bundle stays usable until the
/// remote rejects it.
///
/// # Examples
///
/// ```
/// use mcp_remote::oauth::provider::TokenBundle;
///
/// let bundle: TokenBundle =
///     serde_json::from_str(r#"{"access_token":"T","token_type":"Bearer","expires_in":3600}"#)
///         .unwrap();
/// assert!(bundle.is_usable());
///
/// let expired: TokenBundle =
///     serde_json::from_str(r#"{"access_token":"T","token_type":"Bearer","expires_in":-1}"#)
///         .unwrap();
/// assert!(!expired.is_usable());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBundle {
    /// The bearer token presented to the remote server.
    pub access_token: String,

    /// Token type, in practice always `"Bearer"`.
    pub token_type: String,

    /// Seconds until expiry. Preserved as received (integer or float).
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_expires_in"
    )]
    pub expires_in: Option<serde_json::Number>,

    /// Refresh token, when the server issued one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Space-separated scopes granted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl TokenBundle {
    /// Whether the stored access token may still be presented.
    ///
    /// `expires_in` absent means non-expiring; any positive value counts
    /// as usable.
    pub fn is_usable(&self) -> bool {
        self.expires_in
            .as_ref()
            .and_then(serde_json::Number::as_f64)
            .map_or(true, |secs| secs > 0.0)
    }
}

/// Tolerant `expires_in` deserializer: numbers pass through, anything else
/// is logged and treated as absent.
fn lenient_expires_in<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<serde_json::Number>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::Number(n)) => Some(n),
        Some(other) => {
            tracing::warn!("token bundle carries non-numeric expires_in {other}; ignoring it");
            None
        }
    })
}

// ---------------------------------------------------------------------------
// Client registration types
// ---------------------------------------------------------------------------

/// OAuth client metadata, as sent to a dynamic registration endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMetadata {
    /// Redirect URIs registered for this client.
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    /// Token endpoint authentication method; `"none"` for public clients.
    #[serde(default = "default_auth_method")]
    pub token_endpoint_auth_method: String,
    /// Grant types this client uses.
    #[serde(default = "default_grant_types")]
    pub grant_types: Vec<String>,
    /// Response types this client uses.
    #[serde(default = "default_response_types")]
    pub response_types: Vec<String>,
    /// Human-readable client name shown on consent screens.
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Homepage of the client software.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_uri: Option<String>,
    /// Stable software identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub software_id: Option<String>,
    /// Software version reported to the authorization server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub software_version: Option<String>,
}

fn default_auth_method() -> String {
    "none".to_string()
}
fn default_grant_types() -> Vec<String> {
    vec!["authorization_code".to_string(), "refresh_token".to_string()]
}
fn default_response_types() -> Vec<String> {
    vec!["code".to_string()]
}
fn default_client_name() -> String {
    "mcp-remote".to_string()
}

impl ClientMetadata {
    /// The default public-client metadata for this proxy, registered with
    /// the given redirect URI.
    pub fn default_for(redirect_uri: &str) -> Self {
        Self {
            redirect_uris: vec![redirect_uri.to_string()],
            token_endpoint_auth_method: default_auth_method(),
            grant_types: default_grant_types(),
            response_types: default_response_types(),
            client_name: default_client_name(),
            client_uri: None,
            software_id: Some("mcp-remote".to_string()),
            software_version: Some(crate::VERSION.to_string()),
        }
    }

    /// Ensures `redirect_uri` is among the registered redirect URIs.
    fn with_redirect_uri(mut self, redirect_uri: &str) -> Self {
        if !self.redirect_uris.iter().any(|u| u == redirect_uri) {
            self.redirect_uris.push(redirect_uri.to_string());
        }
        self
    }
}

/// A registered OAuth client: the identifier plus whatever else the
/// registration endpoint (or the operator's static JSON) supplied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInformation {
    /// The client identifier.
    pub client_id: String,
    /// Client secret for confidential clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Remaining registration fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Which persisted credentials to drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialScope {
    /// Tokens, client registration, and verifier.
    All,
    /// The registered client only.
    Client,
    /// The token bundle only.
    Tokens,
    /// The PKCE code verifier only.
    Verifier,
}

// ---------------------------------------------------------------------------
// Credentials (store facade)
// ---------------------------------------------------------------------------

/// Typed facade over the per-fingerprint credential files.
#[derive(Debug, Clone)]
pub struct Credentials {
    store: CredentialStore,
    fingerprint: String,
}

impl Credentials {
    /// Creates the facade for one fingerprint.
    pub fn new(store: CredentialStore, fingerprint: impl Into<String>) -> Self {
        Self {
            store,
            fingerprint: fingerprint.into(),
        }
    }

    /// Loads the stored token bundle, if any.
    pub fn tokens(&self) -> Result<Option<TokenBundle>> {
        self.store.get_json(&self.fingerprint, TOKENS_FILE)
    }

    /// Persists a token bundle.
    ///
    /// An empty `access_token` violates the store invariant; it is logged
    /// but still written, because rejecting it would lose the refresh
    /// token that may accompany it.
    pub fn save_tokens(&self, bundle: &TokenBundle) -> Result<()> {
        if bundle.access_token.is_empty() {
            tracing::warn!("persisting a token bundle with an empty access_token");
        }
        self.store.put_json(&self.fingerprint, TOKENS_FILE, bundle)
    }

    /// Loads the registered client, if any.
    pub fn client_info(&self) -> Result<Option<ClientInformation>> {
        self.store.get_json(&self.fingerprint, CLIENT_INFO_FILE)
    }

    /// Persists the registered client.
    pub fn save_client_info(&self, info: &ClientInformation) -> Result<()> {
        self.store.put_json(&self.fingerprint, CLIENT_INFO_FILE, info)
    }

    /// Loads the pending PKCE code verifier, if any.
    pub fn code_verifier(&self) -> Result<Option<String>> {
        Ok(self
            .store
            .get(&self.fingerprint, CODE_VERIFIER_FILE)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Persists the PKCE code verifier until the exchange consumes it.
    pub fn save_code_verifier(&self, verifier: &str) -> Result<()> {
        self.store
            .put(&self.fingerprint, CODE_VERIFIER_FILE, verifier.as_bytes())
    }

    /// Removes the PKCE code verifier.
    pub fn delete_code_verifier(&self) -> Result<()> {
        self.store.delete(&self.fingerprint, CODE_VERIFIER_FILE)
    }

    /// Drops the credentials named by `scope`.
    pub fn invalidate(&self, scope: CredentialScope) -> Result<()> {
        match scope {
            CredentialScope::All => {
                self.store.delete(&self.fingerprint, TOKENS_FILE)?;
                self.store.delete(&self.fingerprint, CLIENT_INFO_FILE)?;
                self.store.delete(&self.fingerprint, CODE_VERIFIER_FILE)?;
            }
            CredentialScope::Client => self.store.delete(&self.fingerprint, CLIENT_INFO_FILE)?,
            CredentialScope::Tokens => self.store.delete(&self.fingerprint, TOKENS_FILE)?,
            CredentialScope::Verifier => self.store.delete(&self.fingerprint, CODE_VERIFIER_FILE)?,
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Raw token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: String,
    #[serde(default)]
    expires_in: Option<serde_json::Number>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

impl From<TokenResponse> for TokenBundle {
    fn from(raw: TokenResponse) -> Self {
        Self {
            access_token: raw.access_token,
            token_type: raw.token_type,
            expires_in: raw.expires_in,
            refresh_token: raw.refresh_token,
            scope: raw.scope,
        }
    }
}

/// POSTs a form-encoded request to the token endpoint.
async fn post_token_form(
    http: &reqwest::Client,
    token_endpoint: &Url,
    params: &HashMap<&str, &str>,
) -> Result<(u16, String)> {
    let response = http
        .post(token_endpoint.as_str())
        .form(params)
        .send()
        .await
        .map_err(McpRemoteError::Http)?;
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Ok((status, body))
}

/// Verifies the `state` echoed by the callback against the provider's own.
///
/// An absent value is tolerated with a warning (the loopback channel is
/// the trust boundary); a present-but-different value fails the exchange.
fn check_state(expected: &str, received: &AuthCode) -> Result<()> {
    match received.state.as_deref() {
        Some(got) if got == expected => Ok(()),
        Some(_) => Err(McpRemoteError::OAuth(
            "state mismatch in authorization callback".to_string(),
        )
        .into()),
        None => {
            tracing::warn!("authorization callback did not echo the state parameter");
            Ok(())
        }
    }
}

/// Attempts to open `url` in the user's default browser.
///
/// Failures are ignored; the URL is always printed to stderr so the user
/// can open it manually.
fn open_browser(url: &str) {
    eprintln!("Open the following URL in your browser to authorize:\n{url}");
    #[cfg(target_os = "macos")]
    {
        let _ = std::process::Command::new("open").arg(url).spawn();
    }
    #[cfg(target_os = "linux")]
    {
        let _ = std::process::Command::new("xdg-open").arg(url).spawn();
    }
    #[cfg(target_os = "windows")]
    {
        let _ = std::process::Command::new("cmd").args(["/C", "start", "", url]).spawn();
    }
}

// ---------------------------------------------------------------------------
// ClassicalProvider
// ---------------------------------------------------------------------------

/// Authorization-code provider for a pre-registered confidential client.
///
/// No PKCE parameters are sent; the client proves itself with its
/// `client_secret` (when it has one) at the token endpoint.
#[derive(Debug, Clone)]
pub struct ClassicalProvider {
    http: reqwest::Client,
    credentials: Credentials,
    client: ClientInformation,
    redirect_uri: String,
    resource: Option<Url>,
    state: String,
}

impl ClassicalProvider {
    /// Creates a provider for the given pre-registered client.
    ///
    /// The `state` nonce is generated here, once per instance, and sent
    /// unchanged on every authorization URL this provider builds.
    pub fn new(
        http: reqwest::Client,
        credentials: Credentials,
        client: ClientInformation,
        redirect_uri: String,
        resource: Option<Url>,
    ) -> Self {
        Self {
            http,
            credentials,
            client,
            redirect_uri,
            resource,
            state: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// The `state` nonce this provider sends.
    pub fn state(&self) -> &str {
        &self.state
    }

    /// Builds the authorization URL the browser is sent to.
    pub fn authorization_url(&self, authorization_endpoint: &Url) -> Url {
        let mut url = authorization_endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("response_type", "code");
            query.append_pair("client_id", &self.client.client_id);
            query.append_pair("redirect_uri", &self.redirect_uri);
            query.append_pair("state", &self.state);
            if let Some(ref resource) = self.resource {
                query.append_pair("resource", resource.as_str());
            }
        }
        url
    }

    /// Exchanges an authorization code for tokens.
    ///
    /// # Errors
    ///
    /// Returns [`McpRemoteError::TokenExchangeFailed`] with the status and
    /// body on any non-2xx response.
    pub async fn exchange(&self, token_endpoint: &Url, code: &str) -> Result<TokenBundle> {
        let mut params: HashMap<&str, &str> = HashMap::new();
        params.insert("grant_type", "authorization_code");
        params.insert("code", code);
        params.insert("redirect_uri", &self.redirect_uri);
        params.insert("client_id", &self.client.client_id);
        if let Some(ref secret) = self.client.client_secret {
            params.insert("client_secret", secret);
        }

        let (status, body) = post_token_form(&self.http, token_endpoint, &params).await?;
        if !(200..300).contains(&status) {
            return Err(McpRemoteError::TokenExchangeFailed { status, body }.into());
        }
        let raw: TokenResponse = serde_json::from_str(&body).map_err(McpRemoteError::Serialization)?;
        Ok(raw.into())
    }

    /// Exchanges the stored refresh token for a new bundle.
    ///
    /// When the response omits a `refresh_token`, the previous one is
    /// preserved so future refreshes keep working.
    ///
    /// # Errors
    ///
    /// Returns [`McpRemoteError::NoRefreshToken`] when nothing is stored,
    /// or [`McpRemoteError::TokenRefreshFailed`] on a non-2xx response.
    pub async fn refresh(&self, token_endpoint: &Url) -> Result<TokenBundle> {
        let stored = self.credentials.tokens()?;
        let previous_refresh = stored
            .as_ref()
            .and_then(|t| t.refresh_token.clone())
            .ok_or(McpRemoteError::NoRefreshToken)?;

        let mut params: HashMap<&str, &str> = HashMap::new();
        params.insert("grant_type", "refresh_token");
        params.insert("refresh_token", &previous_refresh);
        params.insert("client_id", &self.client.client_id);
        if let Some(ref secret) = self.client.client_secret {
            params.insert("client_secret", secret);
        }

        let (status, body) = post_token_form(&self.http, token_endpoint, &params).await?;
        if !(200..300).contains(&status) {
            return Err(
                McpRemoteError::TokenRefreshFailed(format!("HTTP {status}: {body}")).into(),
            );
        }
        let raw: TokenResponse = serde_json::from_str(&body).map_err(McpRemoteError::Serialization)?;
        let mut bundle: TokenBundle = raw.into();
        if bundle.refresh_token.is_none() {
            bundle.refresh_token = Some(previous_refresh);
        }
        Ok(bundle)
    }

    /// Returns a usable access token, running whatever part of the flow is
    /// needed.
    ///
    /// Resolution order: stored-and-usable token, refresh, full browser
    /// authorization.
    pub async fn ensure_access_token(
        &self,
        endpoints: &OAuthEndpoints,
        callback: &CallbackServer,
    ) -> Result<String> {
        if let Some(bundle) = self.credentials.tokens()? {
            if bundle.is_usable() {
                return Ok(bundle.access_token);
            }
        }
        self.refresh_or_authorize(endpoints, callback).await
    }

    /// The refresh-then-authorize tail of the token ladder.
    ///
    /// Used directly when the remote has just rejected the stored token:
    /// the stored bundle must not short-circuit the flow, but its refresh
    /// token is still worth trying before a browser round-trip.
    pub async fn refresh_or_authorize(
        &self,
        endpoints: &OAuthEndpoints,
        callback: &CallbackServer,
    ) -> Result<String> {
        let has_refresh = self
            .credentials
            .tokens()?
            .is_some_and(|t| t.refresh_token.is_some());
        if has_refresh {
            match self.refresh(&endpoints.token_endpoint).await {
                Ok(fresh) => {
                    self.credentials.save_tokens(&fresh)?;
                    return Ok(fresh.access_token);
                }
                Err(e) => tracing::warn!("token refresh failed: {e:#}; re-authorizing"),
            }
        }
        let bundle = self.authorize(endpoints, callback).await?;
        Ok(bundle.access_token)
    }

    /// Runs the interactive browser flow end to end.
    ///
    /// Opens the browser on the authorization URL, waits for the loopback
    /// redirect, verifies `state`, exchanges the code, persists the bundle,
    /// and signals completion to sibling instances.
    pub async fn authorize(
        &self,
        endpoints: &OAuthEndpoints,
        callback: &CallbackServer,
    ) -> Result<TokenBundle> {
        let url = self.authorization_url(&endpoints.authorization_endpoint);
        open_browser(url.as_str());

        let code = callback.wait_for_code().await?;
        check_state(&self.state, &code)?;

        let bundle = self.exchange(&endpoints.token_endpoint, &code.code).await?;
        self.credentials.save_tokens(&bundle)?;
        callback.mark_complete();
        Ok(bundle)
    }

    /// Drops the persisted credentials named by `scope`.
    pub fn invalidate(&self, scope: CredentialScope) -> Result<()> {
        self.credentials.invalidate(scope)
    }
}

// ---------------------------------------------------------------------------
// PkceProvider
// ---------------------------------------------------------------------------

/// Authorization-code provider for a dynamically registered public client
/// using PKCE S256.
#[derive(Debug, Clone)]
pub struct PkceProvider {
    http: reqwest::Client,
    credentials: Credentials,
    metadata: ClientMetadata,
    redirect_uri: String,
    resource: Option<Url>,
    state: String,
}

impl PkceProvider {
    /// Creates a PKCE provider.
    ///
    /// `metadata` is the registration payload; callers usually pass
    /// [`ClientMetadata::default_for`] or the operator's
    /// `--static-oauth-client-metadata` override.
    pub fn new(
        http: reqwest::Client,
        credentials: Credentials,
        metadata: ClientMetadata,
        redirect_uri: String,
        resource: Option<Url>,
    ) -> Self {
        let metadata = metadata.with_redirect_uri(&redirect_uri);
        Self {
            http,
            credentials,
            metadata,
            redirect_uri,
            resource,
            state: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// The `state` nonce this provider sends.
    pub fn state(&self) -> &str {
        &self.state
    }

    /// Returns the registered client, registering one when none is stored.
    async fn resolve_client(&self, endpoints: &OAuthEndpoints) -> Result<ClientInformation> {
        if let Some(info) = self.credentials.client_info()? {
            return Ok(info);
        }
        let registration_endpoint = endpoints.registration_endpoint.as_ref().ok_or_else(|| {
            McpRemoteError::Registration(
                "authorization server does not advertise a registration endpoint; \
                 pass --static-oauth-client-info instead"
                    .to_string(),
            )
        })?;

        let response = self
            .http
            .post(registration_endpoint.as_str())
            .json(&self.metadata)
            .send()
            .await
            .map_err(McpRemoteError::Http)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(
                McpRemoteError::Registration(format!("HTTP {status}: {body}")).into(),
            );
        }
        let info: ClientInformation = response.json().await.map_err(McpRemoteError::Http)?;
        self.credentials.save_client_info(&info)?;
        Ok(info)
    }

    /// Builds the authorization URL, including the S256 challenge.
    pub fn authorization_url(
        &self,
        authorization_endpoint: &Url,
        client_id: &str,
        code_challenge: &str,
    ) -> Url {
        let mut url = authorization_endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("response_type", "code");
            query.append_pair("client_id", client_id);
            query.append_pair("redirect_uri", &self.redirect_uri);
            query.append_pair("state", &self.state);
            query.append_pair("code_challenge", code_challenge);
            query.append_pair("code_challenge_method", pkce::CHALLENGE_METHOD);
            if let Some(ref resource) = self.resource {
                query.append_pair("resource", resource.as_str());
            }
        }
        url
    }

    /// Exchanges an authorization code, proving possession of the stored
    /// verifier.
    async fn exchange(
        &self,
        token_endpoint: &Url,
        client: &ClientInformation,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenBundle> {
        let resource_str = self.resource.as_ref().map(|r| r.as_str().to_string());

        let mut params: HashMap<&str, &str> = HashMap::new();
        params.insert("grant_type", "authorization_code");
        params.insert("code", code);
        params.insert("redirect_uri", &self.redirect_uri);
        params.insert("client_id", &client.client_id);
        params.insert("code_verifier", code_verifier);
        if let Some(ref secret) = client.client_secret {
            params.insert("client_secret", secret);
        }
        if let Some(ref resource) = resource_str {
            params.insert("resource", resource);
        }

        let (status, body) = post_token_form(&self.http, token_endpoint, &params).await?;
        if !(200..300).contains(&status) {
            return Err(McpRemoteError::TokenExchangeFailed { status, body }.into());
        }
        let raw: TokenResponse = serde_json::from_str(&body).map_err(McpRemoteError::Serialization)?;
        Ok(raw.into())
    }

    /// Exchanges the stored refresh token for a new bundle, preserving the
    /// previous refresh token when the response omits one.
    pub async fn refresh(&self, token_endpoint: &Url) -> Result<TokenBundle> {
        let previous_refresh = self
            .credentials
            .tokens()?
            .and_then(|t| t.refresh_token)
            .ok_or(McpRemoteError::NoRefreshToken)?;
        let client = self.credentials.client_info()?.ok_or_else(|| {
            McpRemoteError::OAuth("no registered client to refresh with".to_string())
        })?;
        let resource_str = self.resource.as_ref().map(|r| r.as_str().to_string());

        let mut params: HashMap<&str, &str> = HashMap::new();
        params.insert("grant_type", "refresh_token");
        params.insert("refresh_token", &previous_refresh);
        params.insert("client_id", &client.client_id);
        if let Some(ref secret) = client.client_secret {
            params.insert("client_secret", secret);
        }
        if let Some(ref resource) = resource_str {
            params.insert("resource", resource);
        }

        let (status, body) = post_token_form(&self.http, token_endpoint, &params).await?;
        if !(200..300).contains(&status) {
            return Err(
                McpRemoteError::TokenRefreshFailed(format!("HTTP {status}: {body}")).into(),
            );
        }
        let raw: TokenResponse = serde_json::from_str(&body).map_err(McpRemoteError::Serialization)?;
        let mut bundle: TokenBundle = raw.into();
        if bundle.refresh_token.is_none() {
            bundle.refresh_token = Some(previous_refresh);
        }
        Ok(bundle)
    }

    /// Returns a usable access token, running whatever part of the flow is
    /// needed. Same ladder as the classical provider.
    pub async fn ensure_access_token(
        &self,
        endpoints: &OAuthEndpoints,
        callback: &CallbackServer,
    ) -> Result<String> {
        if let Some(bundle) = self.credentials.tokens()? {
            if bundle.is_usable() {
                return Ok(bundle.access_token);
            }
        }
        self.refresh_or_authorize(endpoints, callback).await
    }

    /// The refresh-then-authorize tail of the token ladder; see
    /// [`ClassicalProvider::refresh_or_authorize`].
    pub async fn refresh_or_authorize(
        &self,
        endpoints: &OAuthEndpoints,
        callback: &CallbackServer,
    ) -> Result<String> {
        let has_refresh = self
            .credentials
            .tokens()?
            .is_some_and(|t| t.refresh_token.is_some());
        if has_refresh {
            match self.refresh(&endpoints.token_endpoint).await {
                Ok(fresh) => {
                    self.credentials.save_tokens(&fresh)?;
                    return Ok(fresh.access_token);
                }
                Err(e) => tracing::warn!("token refresh failed: {e:#}; re-authorizing"),
            }
        }
        let bundle = self.authorize(endpoints, callback).await?;
        Ok(bundle.access_token)
    }

    /// Runs the interactive PKCE browser flow end to end.
    ///
    /// The verifier is persisted before the browser opens (so a restarted
    /// process can still complete the exchange), consumed once, and
    /// deleted after.
    pub async fn authorize(
        &self,
        endpoints: &OAuthEndpoints,
        callback: &CallbackServer,
    ) -> Result<TokenBundle> {
        let client = self.resolve_client(endpoints).await?;

        let challenge = pkce::generate()?;
        self.credentials.save_code_verifier(&challenge.verifier)?;

        let url = self.authorization_url(
            &endpoints.authorization_endpoint,
            &client.client_id,
            &challenge.challenge,
        );
        open_browser(url.as_str());

        let code = callback.wait_for_code().await?;
        check_state(&self.state, &code)?;

        let verifier = self.credentials.code_verifier()?.ok_or_else(|| {
            McpRemoteError::OAuth("code verifier disappeared before the exchange".to_string())
        })?;
        let bundle = self
            .exchange(&endpoints.token_endpoint, &client, &code.code, &verifier)
            .await?;
        self.credentials.save_tokens(&bundle)?;
        self.credentials.delete_code_verifier()?;
        callback.mark_complete();
        Ok(bundle)
    }

    /// Drops the persisted credentials named by `scope`.
    pub fn invalidate(&self, scope: CredentialScope) -> Result<()> {
        self.credentials.invalidate(scope)
    }
}

// ---------------------------------------------------------------------------
// OAuthProvider (flow selection)
// ---------------------------------------------------------------------------

/// The configured provider: classical when static client credentials were
/// supplied, PKCE otherwise.
#[derive(Debug, Clone)]
pub enum OAuthProvider {
    /// Classical confidential-client flow.
    Classical(ClassicalProvider),
    /// PKCE public-client flow.
    Pkce(PkceProvider),
}

impl OAuthProvider {
    /// Builds the provider selected by the settings.
    pub fn from_settings(
        settings: &crate::config::Settings,
        http: reqwest::Client,
        store: CredentialStore,
    ) -> Self {
        let credentials = Credentials::new(store, settings.fingerprint.clone());
        let redirect_uri = settings.redirect_uri();
        match settings.static_client_info {
            Some(ref client) => Self::Classical(ClassicalProvider::new(
                http,
                credentials,
                client.clone(),
                redirect_uri,
                settings.resource.clone(),
            )),
            None => {
                let metadata = settings
                    .static_client_metadata
                    .clone()
                    .unwrap_or_else(|| ClientMetadata::default_for(&redirect_uri));
                Self::Pkce(PkceProvider::new(
                    http,
                    credentials,
                    metadata,
                    redirect_uri,
                    settings.resource.clone(),
                ))
            }
        }
    }

    /// See [`ClassicalProvider::ensure_access_token`] /
    /// [`PkceProvider::ensure_access_token`].
    pub async fn ensure_access_token(
        &self,
        endpoints: &OAuthEndpoints,
        callback: &CallbackServer,
    ) -> Result<String> {
        match self {
            Self::Classical(p) => p.ensure_access_token(endpoints, callback).await,
            Self::Pkce(p) => p.ensure_access_token(endpoints, callback).await,
        }
    }

    /// See [`ClassicalProvider::refresh_or_authorize`] /
    /// [`PkceProvider::refresh_or_authorize`].
    pub async fn refresh_or_authorize(
        &self,
        endpoints: &OAuthEndpoints,
        callback: &CallbackServer,
    ) -> Result<String> {
        match self {
            Self::Classical(p) => p.refresh_or_authorize(endpoints, callback).await,
            Self::Pkce(p) => p.refresh_or_authorize(endpoints, callback).await,
        }
    }

    /// Drops the persisted credentials named by `scope`.
    pub fn invalidate(&self, scope: CredentialScope) -> Result<()> {
        match self {
            Self::Classical(p) => p.invalidate(scope),
            Self::Pkce(p) => p.invalidate(scope),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_credentials() -> (tempfile::TempDir, Credentials) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CredentialStore::at_root(dir.path());
        (dir, Credentials::new(store, "cafe"))
    }

    fn classical(credentials: Credentials, secret: Option<&str>) -> ClassicalProvider {
        ClassicalProvider::new(
            reqwest::Client::new(),
            credentials,
            ClientInformation {
                client_id: "A".to_string(),
                client_secret: secret.map(str::to_string),
                extra: serde_json::Map::new(),
            },
            "http://localhost:3334/oauth/callback".to_string(),
            None,
        )
    }

    fn bundle(expires_in: Option<i64>, refresh: Option<&str>) -> TokenBundle {
        TokenBundle {
            access_token: "T".to_string(),
            token_type: "Bearer".to_string(),
            expires_in: expires_in.map(serde_json::Number::from),
            refresh_token: refresh.map(str::to_string),
            scope: None,
        }
    }

    // -----------------------------------------------------------------------
    // TokenBundle
    // -----------------------------------------------------------------------

    #[test]
    fn test_bundle_without_expiry_is_usable() {
        assert!(bundle(None, None).is_usable());
    }

    #[test]
    fn test_bundle_with_positive_expiry_is_usable() {
        assert!(bundle(Some(3600), None).is_usable());
    }

    #[test]
    fn test_bundle_with_nonpositive_expiry_is_expired() {
        assert!(!bundle(Some(0), None).is_usable());
        assert!(!bundle(Some(-1), None).is_usable());
    }

    #[test]
    fn test_non_numeric_expires_in_is_tolerated() {
        let parsed: TokenBundle = serde_json::from_str(
            r#"{"access_token":"T","token_type":"Bearer","expires_in":"soon"}"#,
        )
        .expect("lenient parse");
        assert!(parsed.expires_in.is_none());
        assert!(parsed.is_usable());
    }

    #[test]
    fn test_bundle_json_roundtrip() {
        let original = bundle(Some(-1), Some("R"));
        let json = serde_json::to_string(&original).expect("serialize");
        let restored: TokenBundle = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(restored.access_token, original.access_token);
        assert_eq!(restored.expires_in, original.expires_in);
        assert_eq!(restored.refresh_token, original.refresh_token);
    }

    // -----------------------------------------------------------------------
    // Credentials
    // -----------------------------------------------------------------------

    #[test]
    fn test_tokens_roundtrip_through_store() {
        let (_dir, credentials) = temp_credentials();
        credentials.save_tokens(&bundle(Some(3600), Some("R"))).expect("save");
        let restored = credentials.tokens().expect("load").expect("present");
        assert_eq!(restored.access_token, "T");
        assert_eq!(restored.refresh_token.as_deref(), Some("R"));
    }

    #[test]
    fn test_invalidate_all_removes_everything() {
        let (_dir, credentials) = temp_credentials();
        credentials.save_tokens(&bundle(None, None)).expect("tokens");
        credentials
            .save_client_info(&ClientInformation {
                client_id: "A".to_string(),
                client_secret: None,
                extra: serde_json::Map::new(),
            })
            .expect("client");
        credentials.save_code_verifier("v").expect("verifier");

        credentials.invalidate(CredentialScope::All).expect("invalidate");
        assert!(credentials.tokens().unwrap().is_none());
        assert!(credentials.client_info().unwrap().is_none());
        assert!(credentials.code_verifier().unwrap().is_none());
    }

    #[test]
    fn test_invalidate_tokens_leaves_client_registration() {
        let (_dir, credentials) = temp_credentials();
        credentials.save_tokens(&bundle(None, None)).expect("tokens");
        credentials
            .save_client_info(&ClientInformation {
                client_id: "A".to_string(),
                client_secret: None,
                extra: serde_json::Map::new(),
            })
            .expect("client");

        credentials.invalidate(CredentialScope::Tokens).expect("invalidate");
        assert!(credentials.tokens().unwrap().is_none());
        assert!(credentials.client_info().unwrap().is_some());
    }

    // -----------------------------------------------------------------------
    // ClassicalProvider
    // -----------------------------------------------------------------------

    #[test]
    fn test_classical_authorization_url_parameters() {
        let (_dir, credentials) = temp_credentials();
        let provider = classical(credentials, Some("B"));
        let endpoint = Url::parse("https://auth.example.com/authorize").unwrap();
        let url = provider.authorization_url(&endpoint);

        let params: HashMap<String, String> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(params.get("response_type").map(String::as_str), Some("code"));
        assert_eq!(params.get("client_id").map(String::as_str), Some("A"));
        assert_eq!(
            params.get("redirect_uri").map(String::as_str),
            Some("http://localhost:3334/oauth/callback")
        );
        assert_eq!(params.get("state").map(String::as_str), Some(provider.state()));
        assert!(
            !params.contains_key("code_challenge"),
            "classical flow must not send PKCE parameters"
        );
    }

    #[test]
    fn test_classical_state_is_stable_per_instance() {
        let (_dir, credentials) = temp_credentials();
        let provider = classical(credentials, None);
        let endpoint = Url::parse("https://auth.example.com/authorize").unwrap();
        let a = provider.authorization_url(&endpoint);
        let b = provider.authorization_url(&endpoint);
        assert_eq!(a, b, "state must not change between URL builds");
    }

    #[test]
    fn test_classical_includes_resource_when_configured() {
        let (_dir, credentials) = temp_credentials();
        let provider = ClassicalProvider::new(
            reqwest::Client::new(),
            credentials,
            ClientInformation {
                client_id: "A".to_string(),
                client_secret: None,
                extra: serde_json::Map::new(),
            },
            "http://localhost:3334/oauth/callback".to_string(),
            Some(Url::parse("https://mcp.example.com/sse").unwrap()),
        );
        let url =
            provider.authorization_url(&Url::parse("https://auth.example.com/authorize").unwrap());
        assert!(url.query_pairs().any(|(k, _)| k == "resource"));
    }

    #[tokio::test]
    async fn test_classical_refresh_without_stored_token_fails() {
        let (_dir, credentials) = temp_credentials();
        let provider = classical(credentials, None);
        let err = provider
            .refresh(&Url::parse("https://auth.example.com/token").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<McpRemoteError>(),
            Some(McpRemoteError::NoRefreshToken)
        ));
    }

    // -----------------------------------------------------------------------
    // PkceProvider
    // -----------------------------------------------------------------------

    #[test]
    fn test_pkce_authorization_url_carries_challenge() {
        let (_dir, credentials) = temp_credentials();
        let provider = PkceProvider::new(
            reqwest::Client::new(),
            credentials,
            ClientMetadata::default_for("http://localhost:3334/oauth/callback"),
            "http://localhost:3334/oauth/callback".to_string(),
            None,
        );
        let url = provider.authorization_url(
            &Url::parse("https://auth.example.com/authorize").unwrap(),
            "dyn-client",
            "CHALLENGE",
        );
        let params: HashMap<String, String> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(params.get("code_challenge").map(String::as_str), Some("CHALLENGE"));
        assert_eq!(params.get("code_challenge_method").map(String::as_str), Some("S256"));
        assert_eq!(params.get("client_id").map(String::as_str), Some("dyn-client"));
    }

    #[test]
    fn test_client_metadata_defaults() {
        let meta = ClientMetadata::default_for("http://localhost:3334/oauth/callback");
        assert_eq!(meta.redirect_uris, vec!["http://localhost:3334/oauth/callback"]);
        assert_eq!(meta.token_endpoint_auth_method, "none");
        assert!(meta.grant_types.contains(&"refresh_token".to_string()));
        assert_eq!(meta.response_types, vec!["code"]);
    }

    #[test]
    fn test_partial_static_metadata_parses_with_defaults() {
        let meta: ClientMetadata =
            serde_json::from_str(r#"{"client_name":"Custom"}"#).expect("parse");
        assert_eq!(meta.client_name, "Custom");
        assert_eq!(meta.token_endpoint_auth_method, "none");
    }

    // -----------------------------------------------------------------------
    // check_state
    // -----------------------------------------------------------------------

    #[test]
    fn test_check_state_accepts_match() {
        let code = AuthCode {
            code: "c".to_string(),
            state: Some("s1".to_string()),
        };
        assert!(check_state("s1", &code).is_ok());
    }

    #[test]
    fn test_check_state_rejects_mismatch() {
        let code = AuthCode {
            code: "c".to_string(),
            state: Some("evil".to_string()),
        };
        assert!(check_state("s1", &code).is_err());
    }

    #[test]
    fn test_check_state_tolerates_absent_state() {
        let code = AuthCode {
            code: "c".to_string(),
            state: None,
        };
        assert!(check_state("s1", &code).is_ok());
    }

    // -----------------------------------------------------------------------
    // OAuthProvider selection
    // -----------------------------------------------------------------------

    #[test]
    fn test_static_client_info_selects_classical_flow() {
        use clap::Parser as _;
        let cli = crate::cli::Cli::try_parse_from([
            "mcp-remote",
            "https://mcp.example.com",
            "--static-oauth-client-info",
            r#"{"client_id":"A","client_secret":"B"}"#,
        ])
        .unwrap();
        let settings = crate::config::Settings::from_cli(&cli).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let provider = OAuthProvider::from_settings(
            &settings,
            reqwest::Client::new(),
            CredentialStore::at_root(dir.path()),
        );
        assert!(matches!(provider, OAuthProvider::Classical(_)));
    }

    #[test]
    fn test_no_static_client_info_selects_pkce_flow() {
        use clap::Parser as _;
        let cli = crate::cli::Cli::try_parse_from(["mcp-remote", "https://mcp.example.com"]).unwrap();
        let settings = crate::config::Settings::from_cli(&cli).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let provider = OAuthProvider::from_settings(
            &settings,
            reqwest::Client::new(),
            CredentialStore::at_root(dir.path()),
        );
        assert!(matches!(provider, OAuthProvider::Pkce(_)));
    }
}
