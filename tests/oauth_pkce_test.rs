//! PKCE authorization flow integration tests using wiremock
//!
//! Exercises the public-client path: dynamic client registration against
//! the advertised endpoint, verifier persistence across the browser
//! round-trip, and the S256 exchange. The browser redirect is simulated
//! by GETting the loopback callback.

use std::time::Duration;

use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mcp_remote::oauth::callback::CallbackServer;
use mcp_remote::oauth::discovery::OAuthEndpoints;
use mcp_remote::oauth::provider::{ClientMetadata, Credentials, PkceProvider, TokenBundle};
use mcp_remote::store::{CredentialStore, CLIENT_INFO_FILE, TOKENS_FILE};

struct Setup {
    _dir: tempfile::TempDir,
    store: CredentialStore,
    provider: PkceProvider,
    callback: CallbackServer,
}

async fn setup() -> Setup {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CredentialStore::at_root(dir.path());
    let callback = CallbackServer::bind(0, "/oauth/callback", Duration::from_secs(5))
        .await
        .expect("bind callback server");
    let redirect_uri = format!("http://localhost:{}/oauth/callback", callback.port());

    let provider = PkceProvider::new(
        reqwest::Client::new(),
        Credentials::new(store.clone(), "cafe"),
        ClientMetadata::default_for(&redirect_uri),
        redirect_uri,
        None,
    );
    Setup {
        _dir: dir,
        store,
        provider,
        callback,
    }
}

fn endpoints_for(base: &str) -> OAuthEndpoints {
    OAuthEndpoints {
        authorization_endpoint: url::Url::parse(&format!("{base}/as/authorize")).unwrap(),
        token_endpoint: url::Url::parse(&format!("{base}/as/token")).unwrap(),
        registration_endpoint: Some(url::Url::parse(&format!("{base}/as/register")).unwrap()),
    }
}

#[tokio::test]
async fn test_pkce_authorize_registers_client_and_exchanges_with_verifier() {
    let mock = MockServer::start().await;
    let base = mock.uri();

    Mock::given(method("POST"))
        .and(path("/as/register"))
        .and(body_string_contains("redirect_uris"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "client_id": "dyn-client",
        })))
        .expect(1)
        .mount(&mock)
        .await;

    Mock::given(method("POST"))
        .and(path("/as/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=xyz"))
        .and(body_string_contains("client_id=dyn-client"))
        .and(body_string_contains("code_verifier="))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "T",
            "token_type": "Bearer",
            "expires_in": 3600,
            "refresh_token": "R",
        })))
        .expect(1)
        .mount(&mock)
        .await;

    let s = setup().await;
    let endpoints = endpoints_for(&base);
    let state = s.provider.state().to_string();
    let callback_port = s.callback.port();

    let browser = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        reqwest::get(format!(
            "http://127.0.0.1:{callback_port}/oauth/callback?code=xyz&state={state}"
        ))
        .await
        .expect("callback GET")
    });

    let bundle = s
        .provider
        .authorize(&endpoints, &s.callback)
        .await
        .expect("authorize");
    assert_eq!(bundle.access_token, "T");
    browser.await.expect("browser task");

    // The registration and the tokens persist; the verifier is consumed.
    assert!(s
        .store
        .get("cafe", CLIENT_INFO_FILE)
        .expect("read client info")
        .is_some());
    let stored: TokenBundle = s
        .store
        .get_json("cafe", TOKENS_FILE)
        .expect("read tokens")
        .expect("tokens present");
    assert_eq!(stored.refresh_token.as_deref(), Some("R"));
    assert!(s
        .store
        .get("cafe", "code_verifier.txt")
        .expect("read verifier")
        .is_none());
}

#[tokio::test]
async fn test_pkce_reuses_stored_registration() {
    let mock = MockServer::start().await;
    let base = mock.uri();

    // No /as/register mock: a registration attempt would 404 and fail the
    // flow. The stored client must be used instead.
    Mock::given(method("POST"))
        .and(path("/as/token"))
        .and(body_string_contains("client_id=stored-client"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "T",
            "token_type": "Bearer",
        })))
        .expect(1)
        .mount(&mock)
        .await;

    let s = setup().await;
    s.store
        .put("cafe", CLIENT_INFO_FILE, br#"{"client_id":"stored-client"}"#)
        .expect("seed client info");

    let endpoints = endpoints_for(&base);
    let state = s.provider.state().to_string();
    let callback_port = s.callback.port();

    let browser = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        reqwest::get(format!(
            "http://127.0.0.1:{callback_port}/oauth/callback?code=xyz&state={state}"
        ))
        .await
        .expect("callback GET")
    });

    s.provider
        .authorize(&endpoints, &s.callback)
        .await
        .expect("authorize");
    browser.await.expect("browser task");
}

#[tokio::test]
async fn test_pkce_without_registration_endpoint_is_a_clear_error() {
    let s = setup().await;
    let endpoints = OAuthEndpoints {
        authorization_endpoint: url::Url::parse("https://as.example.com/authorize").unwrap(),
        token_endpoint: url::Url::parse("https://as.example.com/token").unwrap(),
        registration_endpoint: None,
    };

    let err = s
        .provider
        .authorize(&endpoints, &s.callback)
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("registration endpoint"),
        "{err}"
    );
}
