//! Versioned serialization boundary for persisted snapshots.
//!
//! # Responsibility
//! - Wrap every stored `AppData` blob in `{schemaVersion, data}`.
//! - Upgrade older payloads through an explicit, ordered migration list.
//!
//! # Invariants
//! - A blob without an envelope is schema version 0.
//! - A blob newer than `SNAPSHOT_SCHEMA_VERSION` is rejected, never
//!   partially decoded.

use crate::model::app_data::AppData;
use crate::model::record::Collection;
use crate::repo::state_repo::{RepoError, RepoResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload schema version written by this binary.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    schema_version: u32,
    data: T,
}

struct PayloadMigration {
    from_version: u32,
    upgrade: fn(Value) -> RepoResult<Value>,
}

const PAYLOAD_MIGRATIONS: &[PayloadMigration] = &[PayloadMigration {
    from_version: 0,
    upgrade: upgrade_bare_blob,
}];

/// Encodes a snapshot into the current envelope.
pub fn encode_app_data(data: &AppData) -> RepoResult<String> {
    let envelope = Envelope {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        data,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Decodes a stored blob, upgrading older payload versions on the way.
///
/// `key` only names the blob in error messages.
pub fn decode_app_data(key: &str, raw: &str) -> RepoResult<AppData> {
    let value: Value = serde_json::from_str(raw)?;
    let (mut version, mut payload) = split_envelope(value)?;

    if version > SNAPSHOT_SCHEMA_VERSION {
        return Err(RepoError::UnsupportedPayloadVersion {
            key: key.to_string(),
            found: version,
            latest_supported: SNAPSHOT_SCHEMA_VERSION,
        });
    }

    while version < SNAPSHOT_SCHEMA_VERSION {
        let migration = PAYLOAD_MIGRATIONS
            .iter()
            .find(|migration| migration.from_version == version)
            .ok_or_else(|| {
                RepoError::InvalidData(format!("no payload migration from version {version}"))
            })?;
        payload = (migration.upgrade)(payload)?;
        version += 1;
    }

    Ok(serde_json::from_value(payload)?)
}

fn split_envelope(value: Value) -> RepoResult<(u32, Value)> {
    let Value::Object(mut object) = value else {
        return Err(RepoError::InvalidData(
            "snapshot payload must be a JSON object".to_string(),
        ));
    };

    match (object.remove("schemaVersion"), object.remove("data")) {
        (Some(version), Some(data)) => {
            let version = version
                .as_u64()
                .and_then(|version| u32::try_from(version).ok())
                .ok_or_else(|| {
                    RepoError::InvalidData(format!("invalid schemaVersion value `{version}`"))
                })?;
            Ok((version, data))
        }
        (version, data) => {
            // Not an envelope: put back whatever was taken out.
            if let Some(version) = version {
                object.insert("schemaVersion".to_string(), version);
            }
            if let Some(data) = data {
                object.insert("data".to_string(), data);
            }
            Ok((0, Value::Object(object)))
        }
    }
}

/// Version 0 blobs were written without an envelope and could hold `null`
/// for collections that had never been populated.
fn upgrade_bare_blob(payload: Value) -> RepoResult<Value> {
    let Value::Object(mut object) = payload else {
        return Err(RepoError::InvalidData(
            "legacy snapshot must be a JSON object".to_string(),
        ));
    };
    for collection in Collection::ALL {
        let key = collection.json_key();
        if matches!(object.get(key), Some(Value::Null)) {
            object.insert(key.to_string(), Value::Array(Vec::new()));
        }
    }
    if matches!(object.get("userSettings"), Some(Value::Null)) {
        object.remove("userSettings");
    }
    Ok(Value::Object(object))
}
