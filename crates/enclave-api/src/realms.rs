//! Realm and channel administration.
//!
//! Creating an encrypted realm returns the raw realm key exactly once;
//! only the argon2 hash and the client-side KDF salt are persisted.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use enclave_crypto::realm_key::{RealmKeyMaterial, create_realm_key};
use enclave_types::api::{Claims, CreateChannelRequest, CreateRealmRequest, CreateRealmResponse};
use enclave_types::models::{Channel, Realm, RealmRole};

use crate::ApiState;
use crate::error::{ApiError, ApiResult};

const NAME_MAX_LEN: usize = 64;

fn validate_name(name: &str, what: &'static str) -> ApiResult<()> {
    if name.trim().is_empty() {
        return Err(ApiError::Validation(format!("{what} name is empty")));
    }
    if name.len() > NAME_MAX_LEN {
        return Err(ApiError::Validation(format!(
            "{what} name is longer than {NAME_MAX_LEN} characters"
        )));
    }
    Ok(())
}

pub async fn create_realm(
    State(state): State<ApiState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateRealmRequest>,
) -> ApiResult<impl IntoResponse> {
    validate_name(&req.name, "realm")?;
    if !req.encrypted && req.encryption_key.is_some() {
        return Err(ApiError::Validation(
            "encryption_key is only valid for encrypted realms".to_string(),
        ));
    }

    // Key material never leaves this handler except through the response.
    let material = if req.encrypted {
        Some(create_realm_key(req.encryption_key.as_deref())?)
    } else {
        None
    };
    let (key_hash, key_salt, one_time_key) = match material {
        Some(RealmKeyMaterial {
            raw,
            key_hash,
            key_salt,
        }) => {
            // The raw key is echoed back only when the server generated it.
            let one_time = if req.encryption_key.is_none() {
                Some(raw.into_string())
            } else {
                None
            };
            (Some(key_hash), Some(key_salt), one_time)
        }
        None => (None, None, None),
    };

    let realm_id = Uuid::new_v4();
    let now = Utc::now();
    {
        let db = state.db.clone();
        let name = req.name.clone();
        let visibility = req.visibility.as_str();
        let encrypted = req.encrypted;
        let key_hash = key_hash.clone();
        let key_salt = key_salt.clone();
        let created_by = claims.sub.to_string();
        let created_at = now.to_rfc3339();
        tokio::task::spawn_blocking(move || {
            db.create_realm_with_owner(
                &realm_id.to_string(),
                &name,
                visibility,
                encrypted,
                key_hash.as_deref(),
                key_salt.as_deref(),
                &created_by,
                &created_at,
            )
        })
        .await?
        .map_err(ApiError::from)?;
    }

    info!(
        "{} ({}) created realm {} ({})",
        claims.username, claims.sub, req.name, realm_id
    );

    let response = CreateRealmResponse {
        realm: Realm {
            id: realm_id,
            name: req.name,
            visibility: req.visibility,
            encrypted: req.encrypted,
            created_at: now,
        },
        encryption_key: one_time_key,
        key_salt,
    };
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn create_channel(
    State(state): State<ApiState>,
    Path(realm_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateChannelRequest>,
) -> ApiResult<impl IntoResponse> {
    validate_name(&req.name, "channel")?;

    let channel = {
        let db = state.db.clone();
        let uid = claims.sub.to_string();
        let name = req.name.clone();
        let encrypted = req.encrypted;
        tokio::task::spawn_blocking(move || -> ApiResult<Channel> {
            let rid = realm_id.to_string();
            if db.get_realm(&rid)?.is_none() {
                return Err(ApiError::NotFound("realm"));
            }
            let role: RealmRole = db
                .get_member_role(&rid, &uid)?
                .ok_or(ApiError::Forbidden)?
                .parse()
                .map_err(anyhow::Error::msg)?;
            if !role.can_manage_channels() {
                return Err(ApiError::Forbidden);
            }
            if db.channel_name_taken(&rid, &name)? {
                return Err(ApiError::Conflict("channel name is taken".to_string()));
            }

            let channel_id = Uuid::new_v4();
            let now = Utc::now();
            let encrypted_at = encrypted.then(|| now.to_rfc3339());
            db.create_channel(
                &channel_id.to_string(),
                &rid,
                &name,
                encrypted,
                encrypted_at.as_deref(),
                &now.to_rfc3339(),
            )?;
            Ok(Channel {
                id: channel_id,
                realm_id,
                name,
                encrypted,
                created_at: now,
            })
        })
        .await??
    };

    info!(
        "{} ({}) created channel {} ({}) in realm {}",
        claims.username, claims.sub, channel.name, channel.id, realm_id
    );

    Ok((StatusCode::CREATED, Json(channel)))
}
