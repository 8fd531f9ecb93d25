//! Read key distribution.
//!
//! Read keys are stored in the group itself: `{keyId}_for_{agentId}` holds
//! the key sealed to that agent, `{keyId}_for_everyone` holds it in the
//! clear for public groups.

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use covalue_core::{
    stable_stringify, AgentId, AgentSecret, CoId, CryptoProvider, KeyId, KeySecret, Sealed,
};

use crate::error::{PermsError, Result};
use crate::group::{GroupState, MapOp};
use crate::role::EVERYONE;

fn reveal_nonce(group: &CoId, key_id: &KeyId, target: &str) -> Result<Vec<u8>> {
    #[derive(Serialize)]
    struct RevealNonce<'a> {
        #[serde(rename = "in")]
        in_id: &'a CoId,
        key: &'a KeyId,
        #[serde(rename = "for")]
        for_target: &'a str,
    }
    Ok(stable_stringify(&RevealNonce {
        in_id: group,
        key: key_id,
        for_target: target,
    })?
    .into_bytes())
}

/// Build the group change that reveals `secret` to `to`.
pub fn reveal_read_key(
    crypto: &dyn CryptoProvider,
    group: &CoId,
    key_id: &KeyId,
    secret: &KeySecret,
    from: &AgentSecret,
    to: &AgentId,
) -> Result<MapOp> {
    let nonce = reveal_nonce(group, key_id, to.as_str())?;
    let sealed = crypto.seal(secret.as_str().as_bytes(), &from.sealer, &to.sealer_id(), &nonce)?;
    Ok(MapOp::set(
        GroupState::revelation_key(key_id, to.as_str()),
        sealed.as_str(),
    ))
}

/// Build the group change that publishes `secret` to everyone.
pub fn reveal_read_key_to_everyone(key_id: &KeyId, secret: &KeySecret) -> MapOp {
    MapOp::set(GroupState::revelation_key(key_id, EVERYONE), secret.as_str())
}

/// Recover the secret of `key_id` for `agent`, if the group revealed it.
///
/// Returns `Ok(None)` when there is no revelation for the agent; a revelation
/// that does not decrypt to the expected key is an error.
pub fn read_key_secret(
    crypto: &dyn CryptoProvider,
    state: &GroupState,
    key_id: &KeyId,
    agent: &AgentId,
    agent_secret: &AgentSecret,
) -> Result<Option<KeySecret>> {
    if let Some(entry) = state.entry(&GroupState::revelation_key(key_id, agent.as_str())) {
        let sealed = entry
            .value
            .as_str()
            .ok_or_else(|| PermsError::MissingReadKey(state.id().clone()))
            .and_then(|s| Sealed::parse(s).map_err(PermsError::from))?;
        let nonce = reveal_nonce(state.id(), key_id, agent.as_str())?;
        let bytes = crypto.unseal(&sealed, &agent_secret.sealer, &entry.author.sealer_id(), &nonce)?;
        let secret = String::from_utf8(bytes)
            .map_err(|_| PermsError::MissingReadKey(state.id().clone()))
            .and_then(|s| KeySecret::parse(s).map_err(PermsError::from))?;
        return verify_key(crypto, state, key_id, secret).map(Some);
    }

    if let Some(entry) = state.entry(&GroupState::revelation_key(key_id, EVERYONE)) {
        if let Some(Ok(secret)) = entry.value.as_str().map(KeySecret::parse) {
            return verify_key(crypto, state, key_id, secret).map(Some);
        }
    }

    Ok(None)
}

/// The current read key of the group, for `agent`.
pub fn current_read_key(
    crypto: &dyn CryptoProvider,
    state: &GroupState,
    agent: &AgentId,
    agent_secret: &AgentSecret,
) -> Result<(KeyId, KeySecret)> {
    let key_id = state
        .read_key_id()
        .ok_or_else(|| PermsError::MissingReadKey(state.id().clone()))?;
    let secret = read_key_secret(crypto, state, &key_id, agent, agent_secret)?
        .ok_or_else(|| PermsError::MissingReadKey(state.id().clone()))?;
    Ok((key_id, secret))
}

fn verify_key(
    crypto: &dyn CryptoProvider,
    state: &GroupState,
    expected: &KeyId,
    secret: KeySecret,
) -> Result<KeySecret> {
    if &crypto.key_id(&secret)? != expected {
        warn!(group = %state.id(), key = %expected, "Revealed key does not match its id");
        return Err(PermsError::MissingReadKey(state.id().clone()));
    }
    Ok(secret)
}

/// The readKey entry pointing at `key_id`.
pub fn set_read_key(key_id: &KeyId) -> MapOp {
    MapOp::Set {
        key: "readKey".to_string(),
        value: Value::String(key_id.to_string()),
    }
}
