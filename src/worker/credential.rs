use chrono::{DateTime, Duration, Utc};
use rand::{distributions::Alphanumeric, Rng};

use crate::{
    config::{
        DEFAULT_CREDENTIAL_TTL, DEFAULT_REALM, DEFAULT_STUN_SERVERS, DEFAULT_TURN_SERVER,
        PLACEHOLDER_USERNAME,
    },
    protocol::{Credential, TurnServer},
};

use super::provider::{CredentialRequest, ProviderCredential};

const SECRET_LEN: usize = 24;

/// Keeps ASCII letters and digits only; an empty result becomes the
/// placeholder name.
pub fn sanitize_username(username: &str) -> String {
    let sanitized: String = username
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();

    if sanitized.is_empty() {
        PLACEHOLDER_USERNAME.to_owned()
    } else {
        sanitized
    }
}

pub fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect()
}

/// Builds the provider request for `username`. The millisecond suffix keeps
/// connection names unique across repeated requests for the same user.
pub fn build_request(username: &str, ttl: Option<u64>, now: DateTime<Utc>) -> CredentialRequest {
    let user_name = format!("{}{}", sanitize_username(username), now.timestamp_millis());

    CredentialRequest {
        connection_name: format!("webrtc-{}", user_name),
        user_name,
        password: generate_secret(),
        ttl: ttl.unwrap_or(DEFAULT_CREDENTIAL_TTL),
    }
}

/// Fills every field the provider left out.
pub fn assemble(
    request: &CredentialRequest,
    response: ProviderCredential,
    now: DateTime<Utc>,
) -> Credential {
    let username = response
        .user_name
        .unwrap_or_else(|| request.user_name.clone());
    let password = response
        .password
        .unwrap_or_else(|| request.password.clone());
    let realm = response.realm.unwrap_or_else(|| DEFAULT_REALM.to_owned());
    let sip_uri = response
        .sip_uri
        .unwrap_or_else(|| format!("sip:{}@{}", username, realm));

    // A stale provider expiry is replaced by one computed from the ttl.
    let expires_at = response
        .expires_at
        .filter(|expires_at| *expires_at >= now)
        .unwrap_or_else(|| {
            i64::try_from(request.ttl)
                .ok()
                .and_then(Duration::try_seconds)
                .and_then(|ttl| now.checked_add_signed(ttl))
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        });

    let mut stun_servers = Vec::new();
    let mut turn_servers = Vec::new();

    for server in response.ice_servers.unwrap_or_default() {
        for url in server.urls.to_vec() {
            if url.starts_with("stun:") || url.starts_with("stuns:") {
                stun_servers.push(url);
            } else if url.starts_with("turn:") || url.starts_with("turns:") {
                turn_servers.push(TurnServer {
                    urls: url,
                    username: server.username.clone().unwrap_or_else(|| username.clone()),
                    credential: server.credential.clone().unwrap_or_else(|| password.clone()),
                });
            }
        }
    }

    if stun_servers.is_empty() {
        stun_servers = DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect();
    }

    if turn_servers.is_empty() {
        turn_servers.push(TurnServer {
            urls: DEFAULT_TURN_SERVER.to_owned(),
            username: username.clone(),
            credential: password.clone(),
        });
    }

    Credential {
        username,
        password,
        expires_at,
        realm,
        sip_uri,
        stun_servers,
        turn_servers,
    }
}
