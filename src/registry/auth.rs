//! Registry authorization: challenge discovery and token exchange

use crate::error::handlers::{HttpErrorHandler, NetworkErrorHandler};
use crate::error::Result;
use crate::logging::Logger;
use crate::registry::keychain::Credential;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ChallengeScheme {
    Basic,
    Bearer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AuthChallenge {
    scheme: ChallengeScheme,
    realm: Option<String>,
    service: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// How requests against one repository are authorized
#[derive(Clone, PartialEq, Eq)]
pub enum Authorization {
    Anonymous,
    Basic { username: String, password: String },
    Bearer(String),
}

impl Authorization {
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Authorization::Anonymous => request,
            Authorization::Basic { username, password } => request.basic_auth(username, Some(password)),
            Authorization::Bearer(token) => request.bearer_auth(token),
        }
    }
}

impl std::fmt::Debug for Authorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Authorization::Anonymous => write!(f, "Anonymous"),
            Authorization::Basic { username, .. } => write!(f, "Basic({})", username),
            Authorization::Bearer(_) => write!(f, "Bearer(<redacted>)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Auth {
    client: Client,
    output: Logger,
}

impl Auth {
    pub fn new(client: Client, output: Logger) -> Self {
        Self { client, output }
    }

    /// Obtain an authorization for `actions` (e.g. `pull,push`) on a repository
    pub async fn authorize(
        &self,
        base_url: &str,
        registry: &str,
        repository: &str,
        actions: &str,
        credential: &Credential,
    ) -> Result<Authorization> {
        let Some(challenge) = self.get_auth_challenge(base_url, registry).await? else {
            self.output.detail(&format!("{} does not require authentication", registry));
            return Ok(Authorization::Anonymous);
        };

        match challenge.scheme {
            ChallengeScheme::Basic if credential.is_anonymous() => Ok(Authorization::Anonymous),
            ChallengeScheme::Basic => Ok(Authorization::Basic {
                username: credential.username.clone(),
                password: credential.password.clone(),
            }),
            ChallengeScheme::Bearer => {
                let scope = format!("repository:{}:{}", repository, actions);
                let token = self.get_token(&challenge, registry, &scope, credential).await?;
                Ok(token.map(Authorization::Bearer).unwrap_or(Authorization::Anonymous))
            }
        }
    }

    async fn get_auth_challenge(&self, base_url: &str, registry: &str) -> Result<Option<AuthChallenge>> {
        let url = format!("{}/v2/", base_url);
        self.output.detail(&format!("Sending auth challenge request to {}", url));

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "ping", registry))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            let header = response
                .headers()
                .get(reqwest::header::WWW_AUTHENTICATE)
                .and_then(|h| h.to_str().ok())
                .unwrap_or_default();
            self.output.detail(&format!("Parsing auth header: {}", header));
            return Ok(parse_auth_challenge(header));
        }
        if status.is_success() {
            return Ok(None);
        }

        let text = response.text().await.unwrap_or_default();
        Err(HttpErrorHandler::handle_registry_error(status, &text, "ping", registry))
    }

    async fn get_token(
        &self,
        challenge: &AuthChallenge,
        registry: &str,
        scope: &str,
        credential: &Credential,
    ) -> Result<Option<String>> {
        let Some(realm) = &challenge.realm else {
            self.output.warning(&format!("{} sent a bearer challenge without realm", registry));
            return Ok(None);
        };

        let mut query = vec![("scope", scope)];
        if let Some(service) = &challenge.service {
            query.push(("service", service.as_str()));
        }
        self.output.detail(&format!("Requesting token from {} for {}", realm, scope));

        let mut request = self.client.get(realm).query(&query);
        if !credential.is_anonymous() {
            request = request.basic_auth(&credential.username, Some(&credential.password));
        }
        let response = request
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "token request", registry))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HttpErrorHandler::handle_auth_error(status, &text, registry));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "token response", registry))?;
        let token = body
            .token
            .filter(|t| !t.is_empty())
            .or(body.access_token.filter(|t| !t.is_empty()));
        if let Some(token) = &token {
            self.output.detail(&format!("Token obtained (length: {} chars)", token.len()));
        }
        Ok(token)
    }
}

/// Parse `Bearer realm="...",service="...",scope="..."` or `Basic realm="..."`.
/// Quoted values may contain commas.
fn parse_auth_challenge(header: &str) -> Option<AuthChallenge> {
    let header = header.trim();
    let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));
    let scheme = if scheme.eq_ignore_ascii_case("bearer") {
        ChallengeScheme::Bearer
    } else if scheme.eq_ignore_ascii_case("basic") {
        ChallengeScheme::Basic
    } else {
        return None;
    };

    let mut values = HashMap::new();
    let mut rest = params.trim();
    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();
        let after = after.trim_start();
        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            }
        };
        values.insert(key, value.to_string());
        rest = remaining.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
    }

    Some(AuthChallenge {
        scheme,
        realm: values.remove("realm"),
        service: values.remove("service"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_challenge_with_commas_in_scope() {
        let challenge = parse_auth_challenge(
            r#"Bearer realm="https://ghcr.io/token",service="ghcr.io",scope="repository:knative/builder:pull,push""#,
        )
        .unwrap();
        assert_eq!(challenge.scheme, ChallengeScheme::Bearer);
        assert_eq!(challenge.realm.as_deref(), Some("https://ghcr.io/token"));
        assert_eq!(challenge.service.as_deref(), Some("ghcr.io"));
    }

    #[test]
    fn parses_basic_challenge() {
        let challenge = parse_auth_challenge(r#"Basic realm="Registry Realm""#).unwrap();
        assert_eq!(challenge.scheme, ChallengeScheme::Basic);
        assert_eq!(challenge.realm.as_deref(), Some("Registry Realm"));
        assert_eq!(challenge.service, None);
    }

    #[test]
    fn unknown_schemes_are_ignored() {
        assert!(parse_auth_challenge("Negotiate abc").is_none());
        assert!(parse_auth_challenge("").is_none());
    }

    #[test]
    fn debug_hides_secrets() {
        let debug = format!("{:?}", Authorization::Bearer("tok3n".to_string()));
        assert!(!debug.contains("tok3n"));
    }

    use crate::error::PipelineError;
    use crate::registry::test_server::{bearer_challenge, Reply, TestServer, ROBOT_BASIC};

    fn session() -> Auth {
        Auth::new(Client::new(), Logger::new_quiet())
    }

    fn robot() -> Credential {
        Credential::new("robot", "secret")
    }

    #[tokio::test]
    async fn bearer_challenge_is_exchanged_for_a_token() {
        let server = TestServer::start(|request| match request.path() {
            "/v2/" => bearer_challenge(request),
            "/token" => Reply::new(200).body(r#"{"token":"","access_token":"fresh"}"#),
            _ => Reply::new(404),
        })
        .await;

        let authorization = session()
            .authorize(&server.url(""), &server.registry(), "knative/builder", "pull,push", &robot())
            .await
            .unwrap();
        assert_eq!(authorization, Authorization::Bearer("fresh".to_string()));

        let token_request = server
            .requests()
            .into_iter()
            .find(|r| r.path() == "/token")
            .unwrap();
        assert_eq!(token_request.header("authorization"), Some(ROBOT_BASIC));
        assert!(token_request.query().contains("scope=repository%3Aknative%2Fbuilder%3Apull%2Cpush"));
        assert!(token_request.query().contains("service=test-registry"));
    }

    #[tokio::test]
    async fn anonymous_token_requests_carry_no_credentials() {
        let server = TestServer::start(|request| match request.path() {
            "/v2/" => bearer_challenge(request),
            _ => Reply::new(200).body(r#"{"token":"public"}"#),
        })
        .await;

        let authorization = session()
            .authorize(&server.url(""), &server.registry(), "library/alpine", "pull", &Credential::anonymous())
            .await
            .unwrap();
        assert_eq!(authorization, Authorization::Bearer("public".to_string()));
        assert!(server.requests()[1].header("authorization").is_none());
    }

    #[tokio::test]
    async fn open_registry_needs_no_authorization() {
        let server = TestServer::start(|_| Reply::new(200)).await;
        let authorization = session()
            .authorize(&server.url(""), &server.registry(), "knative/builder", "pull", &robot())
            .await
            .unwrap();
        assert_eq!(authorization, Authorization::Anonymous);
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test]
    async fn basic_challenge_uses_the_credential_directly() {
        let server = TestServer::start(|_| {
            Reply::new(401).header("WWW-Authenticate", r#"Basic realm="Registry Realm""#)
        })
        .await;
        let authorization = session()
            .authorize(&server.url(""), &server.registry(), "knative/builder", "pull", &robot())
            .await
            .unwrap();
        assert_eq!(
            authorization,
            Authorization::Basic {
                username: "robot".to_string(),
                password: "secret".to_string()
            }
        );
    }

    #[tokio::test]
    async fn rejected_token_request_keeps_its_status() {
        let server = TestServer::start(|request| match request.path() {
            "/v2/" => bearer_challenge(request),
            _ => Reply::new(401).body(r#"{"errors":[{"code":"UNAUTHORIZED"}]}"#),
        })
        .await;

        let err = session()
            .authorize(&server.url(""), &server.registry(), "knative/builder", "pull", &robot())
            .await
            .unwrap_err();
        match err {
            PipelineError::Transport { operation, status, .. } => {
                assert_eq!(operation, "token request");
                assert_eq!(status, Some(401));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn failing_ping_is_a_transport_error() {
        let server = TestServer::start(|_| Reply::new(503)).await;
        let err = session()
            .authorize(&server.url(""), &server.registry(), "knative/builder", "pull", &robot())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(503));
    }
}
