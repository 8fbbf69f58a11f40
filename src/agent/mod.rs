//! Agent communication: signing requests, the per-client profile-handle
//! ring, and the upload prologue that precedes every profile body.

pub mod connection;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::Configuration;
use crate::error::ProbeError;
use crate::format;
use crate::graph;
use crate::options::ProbeOptions;
use crate::sysinfo;
use connection::Connection;

/// Size of the ring of recently signed profiles.
const LAST_PROFILES_LIMIT: usize = 10;

/// Poll budget for one profile handle before it is marked errored.
const HANDLE_POLL_BUDGET: u32 = 60;

/// Timeout for HTTP calls to the Blackfire API (signing, handle polling).
const API_TIMEOUT: Duration = Duration::from_secs(10);

/// Query parameters extracted into [`SigningResponse`] fields rather than
/// probe options when a pre-supplied query is parsed locally.
const RESERVED_QUERY_FIELDS: &[&str] =
    &["expires", "userId", "agentIds", "collabToken", "signature"];

/// A signed authorization for one profile upload.
#[derive(Debug, Clone, Default)]
pub struct SigningResponse {
    pub query_string: String,
    pub uuid: String,
    pub profile_url: String,
    pub graph_url: String,
    pub agents: Vec<String>,
    pub collab_token: String,
    pub expires: String,
    pub signature: String,
    pub user_id: String,
    pub options: ProbeOptions,
}

#[derive(Deserialize)]
struct SigningPayload {
    query_string: String,
    #[serde(default)]
    uuid: String,
    #[serde(default)]
    agents: Vec<String>,
    #[serde(default)]
    collab_token: String,
    #[serde(default)]
    expires: String,
    #[serde(default)]
    signature: String,
    #[serde(default)]
    user_id: String,
    #[serde(default, rename = "_links")]
    links: SigningLinks,
    #[serde(default)]
    options: std::collections::HashMap<String, serde_json::Value>,
}

#[derive(Deserialize, Default)]
struct SigningLinks {
    #[serde(default)]
    profile: Option<Href>,
    #[serde(default)]
    graph_url: Option<Href>,
}

#[derive(Deserialize)]
struct Href {
    href: String,
}

impl SigningPayload {
    fn into_response(self) -> SigningResponse {
        let options = self
            .options
            .into_iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect();

        SigningResponse {
            query_string: self.query_string,
            uuid: self.uuid,
            profile_url: self.links.profile.map(|h| h.href).unwrap_or_default(),
            graph_url: self.links.graph_url.map(|h| h.href).unwrap_or_default(),
            agents: self.agents,
            collab_token: self.collab_token,
            expires: self.expires,
            signature: self.signature,
            user_id: self.user_id,
            options,
        }
    }
}

/// Parse a pre-supplied Blackfire query into a signing response without a
/// network round-trip. Reserved fields land on the response; everything else
/// becomes a probe option.
pub fn parse_pre_supplied_query(query: &str) -> SigningResponse {
    let mut response = SigningResponse {
        query_string: query.to_string(),
        ..Default::default()
    };

    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "expires" => response.expires = value.into_owned(),
            "userId" => response.user_id = value.into_owned(),
            "agentIds" => {
                response.agents = value.split(',').map(str::to_string).collect();
            }
            "collabToken" => response.collab_token = value.into_owned(),
            "signature" => response.signature = value.into_owned(),
            _ => response.options.set(key.into_owned(), value.into_owned()),
        }
    }

    response
}

/// Current state of a profile on the Blackfire API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileStatus {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub failure_reason: String,
}

/// A recently signed profile tracked for the dashboard surface.
#[derive(Debug, Clone)]
pub struct ProfileHandle {
    pub uuid: String,
    pub view_url: String,
    pub api_url: String,
    pub title: String,
    pub status: ProfileStatus,
    pub created_at: String,
    retries_remaining: u32,
    sealed: bool,
}

#[derive(Deserialize)]
struct HandlePayload {
    #[serde(default, rename = "label")]
    title: String,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    status: ProfileStatus,
}

impl ProfileHandle {
    fn from_signing(response: &SigningResponse) -> Self {
        Self {
            uuid: response.uuid.clone(),
            view_url: response.profile_url.clone(),
            api_url: response.graph_url.clone(),
            title: String::new(),
            status: ProfileStatus::default(),
            created_at: String::new(),
            retries_remaining: HANDLE_POLL_BUDGET,
            sealed: false,
        }
    }

    /// Poll the API for this profile's status. Sealed handles are final and
    /// never polled again.
    async fn load(&mut self, http: &reqwest::Client, auth: Option<&str>) -> anyhow::Result<()> {
        if self.sealed || self.api_url.is_empty() {
            return Ok(());
        }

        if self.retries_remaining == 0 {
            self.status.name = "errored".to_string();
            self.sealed = true;
            return Ok(());
        }
        self.retries_remaining -= 1;

        let mut request = http.get(&self.api_url);
        if let Some(auth) = auth {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }
        let response = request.send().await?;

        let status = response.status();
        if status.as_u16() == 404 {
            self.status.name = "queued".to_string();
            return Ok(());
        }
        if status.is_client_error() || status.is_server_error() {
            self.status.name = "errored".to_string();
            self.sealed = true;
            return Ok(());
        }

        let payload: HandlePayload = response.json().await?;
        if !payload.title.is_empty() {
            self.title = payload.title;
        }
        if !payload.created_at.is_empty() {
            self.created_at = payload.created_at;
        }
        self.status = payload.status;

        if self.status.code > 0 {
            self.sealed = true;
        }
        Ok(())
    }
}

/// Owns the agent-connection lifecycle for each profile send and the signing
/// state across sends.
pub struct AgentClient {
    agent_socket: String,
    agent_timeout: Duration,
    signing_url: String,
    signing_auth: Option<String>,
    server_auth: Option<String>,
    http: reqwest::Client,
    signing: Option<SigningState>,
    profile_count: u64,
    last_profiles: VecDeque<ProfileHandle>,
}

struct SigningState {
    response: SigningResponse,
    consumed: bool,
}

impl AgentClient {
    pub fn new(config: &Configuration) -> Result<Self, ProbeError> {
        connection::parse_network_address(&config.agent_socket)?;

        let signing_auth = if !config.client_id.is_empty() && !config.client_token.is_empty() {
            let credentials = format!("{}:{}", config.client_id, config.client_token);
            Some(format!("Basic {}", BASE64.encode(credentials)))
        } else {
            None
        };

        let server_auth = if !config.server_id.is_empty() && !config.server_token.is_empty() {
            Some(format!("{}:{}", config.server_id, config.server_token))
        } else {
            None
        };

        let http = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .map_err(|e| ProbeError::ConfigInvalid(format!("building HTTP client: {e}")))?;

        let signing = config.blackfire_query.as_deref().map(|query| SigningState {
            response: parse_pre_supplied_query(query),
            consumed: false,
        });

        Ok(Self {
            agent_socket: config.agent_socket.clone(),
            agent_timeout: config.agent_timeout,
            signing_url: format!(
                "{}/api/v1/signing",
                config.http_endpoint.trim_end_matches('/')
            ),
            signing_auth,
            server_auth,
            http,
            signing,
            profile_count: 0,
            last_profiles: VecDeque::new(),
        })
    }

    /// The query authorizing the next profile. Re-signs when the previous
    /// response has been consumed by a sent profile; a pre-supplied query
    /// with no credentials to re-sign with is reused as-is.
    pub async fn current_blackfire_query(&mut self) -> Result<String, ProbeError> {
        if let Some(state) = &self.signing {
            if !state.consumed || self.signing_auth.is_none() {
                return Ok(state.response.query_string.clone());
            }
        }

        let response = self.send_signing_request().await?;
        let query = response.query_string.clone();
        self.push_handle(ProfileHandle::from_signing(&response));
        self.signing = Some(SigningState {
            response,
            consumed: false,
        });
        Ok(query)
    }

    /// Probe options attached to the current signing state.
    pub fn probe_options(&self) -> ProbeOptions {
        self.signing
            .as_ref()
            .map(|s| s.response.options.clone())
            .unwrap_or_default()
    }

    /// The ring of recently signed profiles, each lazily refreshed against
    /// its API URL.
    pub async fn last_profiles(&mut self) -> Vec<ProfileHandle> {
        let auth = self.signing_auth.clone();
        for handle in &mut self.last_profiles {
            if let Err(e) = handle.load(&self.http, auth.as_deref()).await {
                warn!(uuid = handle.uuid.as_str(), error = %e, "profile status poll failed");
            }
        }
        self.last_profiles.iter().cloned().collect()
    }

    /// Encode and upload one profile: connect, prologue, response check,
    /// body, close. The connection is closed on success and error alike; a
    /// close error surfaces only when nothing failed earlier.
    pub async fn send_profile(
        &mut self,
        profile: &graph::Profile,
        title: &str,
    ) -> Result<(), ProbeError> {
        let query = self.current_blackfire_query().await?;
        let options = self.probe_options();

        let mut body = Vec::new();
        format::write_profile(&mut body, profile, &options, title)?;

        let mut conn = Connection::connect(&self.agent_socket, self.agent_timeout).await?;
        let sent = self.send_over(&mut conn, &query, &options, &body).await;
        let closed = conn.close().await;

        match sent {
            Ok(()) => {
                self.profile_count += 1;
                if let Some(state) = &mut self.signing {
                    state.consumed = true;
                }
                closed
            }
            Err(e) => Err(e),
        }
    }

    async fn send_over(
        &mut self,
        conn: &mut Connection,
        query: &str,
        options: &ProbeOptions,
        body: &[u8],
    ) -> Result<(), ProbeError> {
        let yaml = find_blackfire_yaml();

        let full_query = if self.profile_count > 0 {
            format!("{query}&sub_profile=:{:09}", self.profile_count)
        } else {
            query.to_string()
        };

        let mut probe_header = format!("Blackfire-Probe: {}", sysinfo::runtime_id());
        if yaml.is_some() {
            probe_header.push_str(", blackfire_yml");
        }
        if options.is_timespan_set() {
            probe_header.push_str(", timespan");
        }

        let mut ordered = Vec::new();
        if let Some(auth) = &self.server_auth {
            ordered.push(format!("Blackfire-Auth: {auth}"));
        }
        ordered.push(format!("Blackfire-Query: {full_query}"));
        ordered.push(probe_header);
        conn.write_ordered_headers(&ordered).await?;

        if let Some(path) = yaml {
            self.exchange_yaml(conn, &path).await?;
        }

        conn.write_map_header("os-version", &sysinfo::os_version_pairs())
            .await?;
        conn.write_end_of_headers().await?;

        let response = conn.read_response().await?;
        if let Some(message) = response.get("blackfire-error") {
            return Err(ProbeError::AgentProtocol(message.to_string()));
        }

        conn.write_raw(body).await?;
        conn.flush().await?;
        Ok(())
    }

    /// Offer the local `.blackfire.yml` to the agent. The agent answers one
    /// header: `blackfire_yml=true` requests the file, any other
    /// `Blackfire-Response` declines it.
    async fn exchange_yaml(&self, conn: &mut Connection, path: &Path) -> Result<(), ProbeError> {
        conn.write_end_of_headers().await?;

        let (name, value) = conn.read_encoded_header().await?;
        let value = value.trim();
        match name.as_str() {
            "Blackfire-Response" => {
                if value == "blackfire_yml=true" {
                    debug!(path = %path.display(), "agent requested yaml upload");
                    let data = tokio::fs::read(path).await?;
                    conn.write_encoded_header("Blackfire-Yaml-Size", &data.len().to_string())
                        .await?;
                    conn.write_raw(&data).await?;
                }
                Ok(())
            }
            "Blackfire-Error" => Err(ProbeError::AgentProtocol(value.to_string())),
            _ => Err(ProbeError::AgentProtocol(
                "unexpected agent response".to_string(),
            )),
        }
    }

    async fn send_signing_request(&self) -> Result<SigningResponse, ProbeError> {
        let auth = self.signing_auth.as_ref().ok_or_else(|| {
            ProbeError::SigningFailed("no client credentials configured".to_string())
        })?;

        let response = self
            .http
            .post(&self.signing_url)
            .header(reqwest::header::AUTHORIZATION, auth.as_str())
            .send()
            .await
            .map_err(|e| ProbeError::SigningFailed(e.to_string()))?;

        let status = response.status();
        if status.as_u16() != 201 {
            return Err(ProbeError::SigningFailed(format!(
                "signing request to {} failed: {status}",
                self.signing_url
            )));
        }

        let payload: SigningPayload = response
            .json()
            .await
            .map_err(|e| ProbeError::SigningFailed(format!("JSON error: {e}")))?;

        if payload.query_string.is_empty() {
            return Err(ProbeError::SigningFailed(
                "signing response query was empty".to_string(),
            ));
        }

        Ok(payload.into_response())
    }

    fn push_handle(&mut self, handle: ProfileHandle) {
        self.last_profiles.push_front(handle);
        self.last_profiles.truncate(LAST_PROFILES_LIMIT);
    }
}

/// Derive a child query from the current one by rolling the `sub_profile`
/// field forward: the current id becomes the parent of a fresh random id.
pub fn derive_sub_profile_query(current: &str) -> Result<String, ProbeError> {
    let Some((challenge_part, rest)) = current.split_once("signature=") else {
        return Err(ProbeError::SigningFailed(
            "unable to generate a sub-profile query".to_string(),
        ));
    };
    let challenge = challenge_part.trim_end_matches('&');
    let (signature, params_str) = match rest.split_once('&') {
        Some((signature, params)) => (signature, params),
        None => (rest, ""),
    };

    let mut params: Vec<(String, String)> = form_urlencoded::parse(params_str.as_bytes())
        .into_owned()
        .collect();
    params.retain(|(key, _)| key != "aggreg_samples");

    let parent = params
        .iter()
        .find(|(key, _)| key == "sub_profile")
        .map(|(_, value)| value.split(':').nth(1).unwrap_or("").to_string())
        .unwrap_or_default();
    params.retain(|(key, _)| key != "sub_profile");
    params.push(("sub_profile".to_string(), format!("{parent}:{}", random_profile_id())));
    params.sort();

    let encoded = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(&params)
        .finish();
    Ok(format!("{challenge}&signature={signature}&{encoded}"))
}

/// A 9-character alphanumeric id from 7 random bytes: base64, padding
/// stripped, `+` and `/` folded to letters.
fn random_profile_id() -> String {
    let mut bytes = [0u8; 7];
    rand::thread_rng().fill_bytes(&mut bytes);
    let encoded = BASE64
        .encode(bytes)
        .trim_end_matches('=')
        .replace('+', "A")
        .replace('/', "B");
    encoded[..9].to_string()
}

/// The workspace YAML uploaded to the agent when requested:
/// `.blackfire.yml`, else `.blackfire.yaml`, in the working directory.
fn find_blackfire_yaml() -> Option<PathBuf> {
    for name in [".blackfire.yml", ".blackfire.yaml"] {
        let path = PathBuf::from(name);
        if path.is_file() {
            return Some(path);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with_query(query: &str) -> AgentClient {
        let config = Configuration {
            agent_socket: "tcp://127.0.0.1:8307".to_string(),
            blackfire_query: Some(query.to_string()),
            ..Default::default()
        };
        AgentClient::new(&config).expect("client")
    }

    #[test]
    fn test_parse_pre_supplied_query() {
        let response = parse_pre_supplied_query(
            "expires=9999&userId=u1&agentIds=a,b&collabToken=ct&signature=sig&flag_timespan=1&custom=x",
        );

        assert_eq!(response.expires, "9999");
        assert_eq!(response.user_id, "u1");
        assert_eq!(response.agents, vec!["a", "b"]);
        assert_eq!(response.collab_token, "ct");
        assert_eq!(response.signature, "sig");
        assert_eq!(response.options.get("flag_timespan"), Some("1"));
        assert_eq!(response.options.get("custom"), Some("x"));
        assert_eq!(response.options.get("signature"), None);
    }

    #[tokio::test]
    async fn test_pre_supplied_query_is_reused_without_credentials() {
        let mut client = client_with_query("expires=1&signature=sig");

        let first = client.current_blackfire_query().await.expect("query");
        assert_eq!(first, "expires=1&signature=sig");

        // Consumed by a send; with no credentials the same query is reused.
        client.signing.as_mut().expect("signing").consumed = true;
        let second = client.current_blackfire_query().await.expect("query");
        assert_eq!(second, first);
    }

    #[test]
    fn test_handle_ring_is_bounded_newest_first() {
        let mut client = client_with_query("expires=1&signature=sig");
        for i in 0..12 {
            let mut handle = ProfileHandle::from_signing(&SigningResponse::default());
            handle.uuid = format!("uuid-{i}");
            client.push_handle(handle);
        }

        assert_eq!(client.last_profiles.len(), LAST_PROFILES_LIMIT);
        assert_eq!(client.last_profiles[0].uuid, "uuid-11");
        assert_eq!(client.last_profiles[9].uuid, "uuid-2");
    }

    #[test]
    fn test_sub_profile_id_shape() {
        for _ in 0..32 {
            let id = random_profile_id();
            assert_eq!(id.len(), 9);
            assert!(id.chars().all(|c| c.is_ascii_alphanumeric()), "id {id}");
        }
    }

    #[test]
    fn test_derive_sub_profile_query_appends_child_id() {
        let query = "expires=9999&userId=u&signature=sig&aggreg_samples=10&foo=bar";
        let derived = derive_sub_profile_query(query).expect("derive");

        assert!(derived.starts_with("expires=9999&userId=u&signature=sig&"));
        assert!(!derived.contains("aggreg_samples"));
        assert!(derived.contains("foo=bar"));

        let sub = derived
            .split('&')
            .find_map(|p| p.strip_prefix("sub_profile="))
            .expect("sub_profile field");
        let (parent, id) = sub.split_once("%3A").expect("colon separator");
        assert!(parent.is_empty());
        assert_eq!(id.len(), 9);
    }

    #[test]
    fn test_derive_sub_profile_query_chains_parent() {
        let query = "expires=1&signature=sig&sub_profile=old:abcdefghi";
        let derived = derive_sub_profile_query(query).expect("derive");

        let sub = derived
            .split('&')
            .find_map(|p| p.strip_prefix("sub_profile="))
            .expect("sub_profile field");
        let (parent, id) = sub.split_once("%3A").expect("colon separator");
        assert_eq!(parent, "abcdefghi", "current id becomes the parent");
        assert_eq!(id.len(), 9);
        assert_ne!(id, "abcdefghi");
    }

    #[test]
    fn test_derive_sub_profile_query_requires_signature() {
        assert!(derive_sub_profile_query("expires=1&foo=bar").is_err());
    }
}
