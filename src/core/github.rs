//! The job-dispatch (GitHub Actions) token provider. Spec §6 treats this as
//! an opaque `TokenSource`; this module supplies one concrete implementation
//! grounded in `original_source/executor/executor/github.py`.

use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header, encode as jwt_encode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::error::{Error, Result};

const USER_AGENT: &str = "rust-lang/gha-self-hosted (infra@rust-lang.org)";
const JWT_LIFETIME_SECS: u64 = 5 * 60;
const JWT_CLOCK_SKEW_SECS: u64 = 60;

/// Returned by [`TokenSource::create_runner`] — the registered runner's id
/// (used only for lookup) and its one-shot JIT bootstrap configuration.
#[derive(Debug, Clone)]
pub struct RunnerHandle {
    pub id: i64,
    pub jit_config: String,
}

/// Returned by [`TokenSource::get_runner`].
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerStatus {
    pub busy: bool,
}

/// The collaborator this executor registers a runner against and polls for
/// busy status. Out of scope per spec §1 beyond this interface.
pub trait TokenSource {
    fn create_runner(&self, label: &str, runner_group_id: u64) -> Result<RunnerHandle>;
    fn get_runner(&self, id: i64) -> Result<RunnerStatus>;
}

#[derive(Serialize)]
struct Claims {
    iat: u64,
    exp: u64,
    iss: String,
}

/// GitHub App based token source: mints an installation access token at
/// construction time, then uses it as the bearer for all subsequent calls.
pub struct GitHubTokenSource {
    org: String,
    http: ureq::Agent,
    installation_token: String,
}

impl GitHubTokenSource {
    pub fn new(client_id: &str, private_key_path: &Path, org: &str) -> Result<Self> {
        let http = ureq::AgentBuilder::new().build();

        let private_key =
            fs::read(private_key_path).map_err(|source| Error::ReadConfig {
                path: private_key_path.to_path_buf(),
                source,
            })?;

        let bearer = mint_app_jwt(client_id, &private_key)?;

        let installation_id = fetch_installation_id(&http, org, &bearer)?;
        let installation_token = fetch_installation_token(&http, installation_id, &bearer)?;

        Ok(GitHubTokenSource {
            org: org.to_string(),
            http,
            installation_token,
        })
    }

    fn authorized_request(&self, method: &str, url: &str) -> ureq::Request {
        self.http
            .request(method, url)
            .set("User-Agent", USER_AGENT)
            .set("Authorization", &format!("token {}", self.installation_token))
    }
}

impl TokenSource for GitHubTokenSource {
    fn create_runner(&self, label: &str, runner_group_id: u64) -> Result<RunnerHandle> {
        let url = format!(
            "https://api.github.com/orgs/{}/actions/runners/generate-jitconfig",
            self.org
        );
        let name = format!("{label}-{}", Uuid::new_v4());

        let response = self
            .authorized_request("POST", &url)
            .send_json(json!({
                "name": name,
                "runner_group_id": runner_group_id,
                "labels": [label],
            }))
            .map_err(|err| handle_error(&err, &url))?;

        let body: serde_json::Value = response
            .into_json()
            .map_err(|err| Error::UpstreamError { message: err.to_string() })?;

        let id = body["runner"]["id"].as_i64().ok_or_else(|| Error::UpstreamError {
            message: "generate-jitconfig response missing runner.id".to_string(),
        })?;
        let jit_config = body["encoded_jit_config"]
            .as_str()
            .ok_or_else(|| Error::UpstreamError {
                message: "generate-jitconfig response missing encoded_jit_config".to_string(),
            })?
            .to_string();

        Ok(RunnerHandle { id, jit_config })
    }

    fn get_runner(&self, id: i64) -> Result<RunnerStatus> {
        let url = format!("https://api.github.com/orgs/{}/actions/runners/{id}", self.org);
        let response = self
            .authorized_request("GET", &url)
            .call()
            .map_err(|err| handle_error(&err, &url))?;

        response
            .into_json()
            .map_err(|err| Error::UpstreamError { message: err.to_string() })
    }
}

fn mint_app_jwt(client_id: &str, private_key_pem: &[u8]) -> Result<String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs();

    let claims = Claims {
        iat: now.saturating_sub(JWT_CLOCK_SKEW_SECS),
        exp: now + JWT_LIFETIME_SECS,
        iss: client_id.to_string(),
    };

    let key = EncodingKey::from_rsa_pem(private_key_pem).map_err(|err| Error::UpstreamError {
        message: format!("invalid GitHub App private key: {err}"),
    })?;

    jwt_encode(&Header::new(Algorithm::RS256), &claims, &key).map_err(|err| Error::UpstreamError {
        message: format!("failed to sign GitHub App JWT: {err}"),
    })
}

fn fetch_installation_id(http: &ureq::Agent, org: &str, bearer: &str) -> Result<i64> {
    let url = format!("https://api.github.com/orgs/{org}/installation");
    let response = http
        .get(&url)
        .set("User-Agent", USER_AGENT)
        .set("Authorization", &format!("Bearer {bearer}"))
        .call()
        .map_err(|err| handle_error(&err, &url))?;

    let body: serde_json::Value = response
        .into_json()
        .map_err(|err| Error::UpstreamError { message: err.to_string() })?;
    body["id"].as_i64().ok_or_else(|| Error::UpstreamError {
        message: "installation lookup response missing id".to_string(),
    })
}

fn fetch_installation_token(http: &ureq::Agent, installation_id: i64, bearer: &str) -> Result<String> {
    let url = format!("https://api.github.com/app/installations/{installation_id}/access_tokens");
    let response = http
        .post(&url)
        .set("User-Agent", USER_AGENT)
        .set("Authorization", &format!("Bearer {bearer}"))
        .call()
        .map_err(|err| handle_error(&err, &url))?;

    let body: serde_json::Value = response
        .into_json()
        .map_err(|err| Error::UpstreamError { message: err.to_string() })?;
    body["token"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::UpstreamError {
            message: "access_tokens response missing token".to_string(),
        })
}

fn handle_error(err: &ureq::Error, url: &str) -> Error {
    match err {
        ureq::Error::Status(code, response) => {
            let message = response
                .clone()
                .into_string()
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            Error::UpstreamError {
                message: format!("github responded with status {code} to {url}: {message}"),
            }
        }
        ureq::Error::Transport(transport) => Error::UpstreamError {
            message: format!("request to {url} failed: {transport}"),
        },
    }
}
