//! Invitation minting and code-based realm joining.
//!
//! Minting is rate limited by a long per-(minter, realm) cooldown, and
//! joining an encrypted realm proves knowledge of the realm key before
//! any other invitation check runs.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::{DateTime, Duration, Utc};
use tracing::info;
use uuid::Uuid;

use enclave_crypto::keys::generate_code;
use enclave_crypto::realm_key::verify_realm_key;
use enclave_db::Database;
use enclave_types::api::{
    Claims, CreateInviteRequest, CreateInviteResponse, JoinByCodeRequest, JoinByCodeResponse,
};
use enclave_types::models::{RealmRole, RealmSummary};

use crate::ApiState;
use crate::error::{ApiError, ApiResult};

/// Minimum gap between invitation mints per (minter, realm).
const MINT_COOLDOWN_DAYS: i64 = 180;

const CODE_LEN: usize = 8;
const CODE_RETRY_LIMIT: usize = 5;

pub async fn mint_invitation(
    State(state): State<ApiState>,
    Path(realm_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateInviteRequest>,
) -> ApiResult<impl IntoResponse> {
    let minter = claims.sub;
    let response = {
        let db = state.db.clone();
        tokio::task::spawn_blocking(move || {
            mint_invitation_at(&db, realm_id, minter, &req, Utc::now())
        })
        .await??
    };

    info!(
        "{} ({}) minted invitation {} for realm {}",
        claims.username, claims.sub, response.code, realm_id
    );
    Ok((StatusCode::CREATED, Json(response)))
}

fn mint_invitation_at(
    db: &Database,
    realm_id: Uuid,
    minter: Uuid,
    req: &CreateInviteRequest,
    now: DateTime<Utc>,
) -> ApiResult<CreateInviteResponse> {
    let rid = realm_id.to_string();
    let uid = minter.to_string();

    let realm = db.get_realm(&rid)?.ok_or(ApiError::NotFound("realm"))?;
    let role: RealmRole = db
        .get_member_role(&rid, &uid)?
        .ok_or(ApiError::Forbidden)?
        .parse()
        .map_err(anyhow::Error::msg)?;
    if !role.can_mint_invitations() {
        return Err(ApiError::Forbidden);
    }

    if let Some(minted_at) = db.latest_mint(&uid, &rid)? {
        let minted_at = DateTime::parse_from_rfc3339(&minted_at)
            .map_err(anyhow::Error::from)?
            .with_timezone(&Utc);
        let next_available = minted_at + Duration::days(MINT_COOLDOWN_DAYS);
        if next_available > now {
            return Err(ApiError::MintingCooldown { next_available });
        }
    }

    let code = unique_code(db)?;
    let expires_at = req
        .expires_in
        .map(|hours| now + Duration::hours(i64::from(hours)));

    // The mint record lands in the same transaction as the invitation,
    // so a failed insert never burns the cooldown.
    db.insert_invitation_minted(
        &Uuid::new_v4().to_string(),
        &rid,
        &code,
        &uid,
        req.max_uses,
        expires_at.map(|t| t.to_rfc3339()).as_deref(),
        &now.to_rfc3339(),
    )?;

    Ok(CreateInviteResponse {
        code,
        max_uses: req.max_uses,
        expires_at,
        requires_encryption_key: realm.encrypted,
    })
}

fn unique_code(db: &Database) -> ApiResult<String> {
    for _ in 0..CODE_RETRY_LIMIT {
        let code = generate_code(CODE_LEN);
        if !db.invitation_code_taken(&code)? {
            return Ok(code);
        }
    }
    Err(ApiError::Internal(anyhow::anyhow!(
        "no free invitation code after {CODE_RETRY_LIMIT} draws"
    )))
}

pub async fn join_by_code(
    State(state): State<ApiState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<JoinByCodeRequest>,
) -> ApiResult<Json<JoinByCodeResponse>> {
    let joiner = claims.sub;
    let response = {
        let db = state.db.clone();
        tokio::task::spawn_blocking(move || join_by_code_at(&db, joiner, &req, Utc::now()))
            .await??
    };

    info!(
        "{} ({}) joined realm {} ({}) by invitation",
        claims.username, claims.sub, response.realm.name, response.realm.id
    );
    Ok(Json(response))
}

fn join_by_code_at(
    db: &Database,
    joiner: Uuid,
    req: &JoinByCodeRequest,
    now: DateTime<Utc>,
) -> ApiResult<JoinByCodeResponse> {
    let uid = joiner.to_string();

    let invite = db
        .get_invitation_by_code(req.code.trim())?
        .ok_or(ApiError::NotFound("invitation"))?;
    let realm = db
        .get_realm(&invite.realm_id)?
        .ok_or(ApiError::NotFound("realm"))?;

    // The key gate runs before expiry and use-count checks; a stale or
    // exhausted code reveals nothing without the realm key.
    if realm.encrypted {
        let key_hash = realm
            .key_hash
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("encrypted realm {} has no key hash", realm.id))?;
        match req.encryption_key.as_deref() {
            None => return Err(ApiError::EncryptionKeyRequired),
            Some(candidate) => {
                if !verify_realm_key(candidate, key_hash)? {
                    return Err(ApiError::InvalidEncryptionKey);
                }
            }
        }
    }

    if let Some(expires_at) = invite.expires_at.as_deref() {
        let expires_at = DateTime::parse_from_rfc3339(expires_at)
            .map_err(anyhow::Error::from)?
            .with_timezone(&Utc);
        if now > expires_at {
            return Err(ApiError::InviteExpired);
        }
    }
    if invite.max_uses.is_some_and(|max| invite.uses_count >= max) {
        return Err(ApiError::InviteExhausted);
    }
    if db.is_realm_member(&invite.realm_id, &uid)? {
        return Err(ApiError::AlreadyMember);
    }

    // The use counter is re-checked inside the transaction, so racing
    // joiners cannot oversubscribe a capped invitation.
    let consumed = db.consume_invitation(
        &invite.id,
        &invite.realm_id,
        &uid,
        &Uuid::new_v4().to_string(),
        &now.to_rfc3339(),
    )?;
    if !consumed {
        return Err(ApiError::InviteExhausted);
    }

    Ok(JoinByCodeResponse {
        success: true,
        realm: RealmSummary {
            id: Uuid::parse_str(&realm.id).map_err(anyhow::Error::from)?,
            name: realm.name,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use enclave_crypto::realm_key::create_realm_key;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn seed_user(db: &Database, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        db.create_user(&id.to_string(), name, "hash").unwrap();
        id
    }

    /// Returns the realm id and, for encrypted realms, the raw key.
    fn seed_realm(db: &Database, owner: Uuid, encrypted: bool) -> (Uuid, Option<String>) {
        let realm_id = Uuid::new_v4();
        let now = t0().to_rfc3339();
        let (key_hash, key_salt, raw) = if encrypted {
            let m = create_realm_key(None).unwrap();
            (
                Some(m.key_hash),
                Some(m.key_salt),
                Some(m.raw.into_string()),
            )
        } else {
            (None, None, None)
        };
        db.create_realm(
            &realm_id.to_string(),
            "sanctum",
            "private",
            encrypted,
            key_hash.as_deref(),
            key_salt.as_deref(),
            &owner.to_string(),
            &now,
        )
        .unwrap();
        db.add_realm_member(&realm_id.to_string(), &owner.to_string(), "owner", &now)
            .unwrap();
        (realm_id, raw)
    }

    fn invite_req(max_uses: Option<u32>, expires_in: Option<u32>) -> CreateInviteRequest {
        CreateInviteRequest {
            max_uses,
            expires_in,
        }
    }

    fn seed_invite(
        db: &Database,
        realm_id: Uuid,
        minter: Uuid,
        max_uses: Option<u32>,
        expires_at: Option<DateTime<Utc>>,
    ) -> String {
        let code = generate_code(CODE_LEN);
        db.insert_invitation(
            &Uuid::new_v4().to_string(),
            &realm_id.to_string(),
            &code,
            &minter.to_string(),
            max_uses,
            expires_at.map(|t| t.to_rfc3339()).as_deref(),
            &t0().to_rfc3339(),
        )
        .unwrap();
        code
    }

    #[test]
    fn minting_requires_a_privileged_role() {
        let db = db();
        let owner = seed_user(&db, "ada");
        let outsider = seed_user(&db, "bob");
        let member = seed_user(&db, "eve");
        let admin = seed_user(&db, "kim");
        let (realm_id, _) = seed_realm(&db, owner, false);
        let now = t0().to_rfc3339();
        db.add_realm_member(&realm_id.to_string(), &member.to_string(), "member", &now)
            .unwrap();
        db.add_realm_member(&realm_id.to_string(), &admin.to_string(), "admin", &now)
            .unwrap();

        let req = invite_req(Some(5), None);
        assert!(matches!(
            mint_invitation_at(&db, realm_id, outsider, &req, t0()),
            Err(ApiError::Forbidden)
        ));
        assert!(matches!(
            mint_invitation_at(&db, realm_id, member, &req, t0()),
            Err(ApiError::Forbidden)
        ));

        let minted = mint_invitation_at(&db, realm_id, admin, &req, t0()).unwrap();
        assert_eq!(minted.max_uses, Some(5));
        assert!(!minted.requires_encryption_key);
        assert!(mint_invitation_at(&db, realm_id, owner, &req, t0()).is_ok());
    }

    #[test]
    fn mint_cooldown_opens_after_180_days() {
        let db = db();
        let owner = seed_user(&db, "ada");
        let (realm_id, _) = seed_realm(&db, owner, false);
        let req = invite_req(None, None);

        mint_invitation_at(&db, realm_id, owner, &req, t0()).unwrap();

        let reopen = t0() + Duration::days(MINT_COOLDOWN_DAYS);
        let err = mint_invitation_at(&db, realm_id, owner, &req, reopen - Duration::seconds(1))
            .err()
            .unwrap();
        match err {
            ApiError::MintingCooldown { next_available } => assert_eq!(next_available, reopen),
            other => panic!("expected cooldown, got {other:?}"),
        }

        // The boundary instant itself is allowed, and starts a new cooldown.
        mint_invitation_at(&db, realm_id, owner, &req, reopen).unwrap();
        assert!(matches!(
            mint_invitation_at(&db, realm_id, owner, &req, reopen),
            Err(ApiError::MintingCooldown { .. })
        ));
    }

    #[test]
    fn mint_cooldown_is_scoped_per_realm() {
        let db = db();
        let owner = seed_user(&db, "ada");
        let (first, _) = seed_realm(&db, owner, false);
        let (second, _) = seed_realm(&db, owner, false);
        let req = invite_req(None, None);

        mint_invitation_at(&db, first, owner, &req, t0()).unwrap();
        mint_invitation_at(&db, second, owner, &req, t0()).unwrap();
    }

    #[test]
    fn expiry_is_measured_in_hours() {
        let db = db();
        let owner = seed_user(&db, "ada");
        let (realm_id, _) = seed_realm(&db, owner, false);

        let minted =
            mint_invitation_at(&db, realm_id, owner, &invite_req(None, Some(48)), t0()).unwrap();
        assert_eq!(minted.expires_at, Some(t0() + Duration::hours(48)));
    }

    #[test]
    fn join_admits_a_new_member_once() {
        let db = db();
        let owner = seed_user(&db, "ada");
        let joiner = seed_user(&db, "bob");
        let (realm_id, _) = seed_realm(&db, owner, false);
        let code = seed_invite(&db, realm_id, owner, None, None);

        let req = JoinByCodeRequest {
            code: code.clone(),
            encryption_key: None,
        };
        let joined = join_by_code_at(&db, joiner, &req, t0()).unwrap();
        assert!(joined.success);
        assert_eq!(joined.realm.id, realm_id);
        assert_eq!(joined.realm.name, "sanctum");
        assert!(
            db.is_realm_member(&realm_id.to_string(), &joiner.to_string())
                .unwrap()
        );
        let invite = db.get_invitation_by_code(&code).unwrap().unwrap();
        assert_eq!(invite.uses_count, 1);

        assert!(matches!(
            join_by_code_at(&db, joiner, &req, t0()),
            Err(ApiError::AlreadyMember)
        ));
    }

    #[test]
    fn unknown_code_is_not_found() {
        let db = db();
        let joiner = seed_user(&db, "bob");
        let req = JoinByCodeRequest {
            code: "NOSUCH00".to_string(),
            encryption_key: None,
        };
        assert!(matches!(
            join_by_code_at(&db, joiner, &req, t0()),
            Err(ApiError::NotFound(_))
        ));
    }

    #[test]
    fn expired_and_exhausted_invites_are_rejected() {
        let db = db();
        let owner = seed_user(&db, "ada");
        let bob = seed_user(&db, "bob");
        let eve = seed_user(&db, "eve");
        let (realm_id, _) = seed_realm(&db, owner, false);

        let stale = seed_invite(&db, realm_id, owner, None, Some(t0() - Duration::hours(1)));
        assert!(matches!(
            join_by_code_at(
                &db,
                bob,
                &JoinByCodeRequest {
                    code: stale,
                    encryption_key: None
                },
                t0()
            ),
            Err(ApiError::InviteExpired)
        ));

        let capped = seed_invite(&db, realm_id, owner, Some(1), None);
        let req = |code: &str| JoinByCodeRequest {
            code: code.to_string(),
            encryption_key: None,
        };
        join_by_code_at(&db, bob, &req(&capped), t0()).unwrap();
        assert!(matches!(
            join_by_code_at(&db, eve, &req(&capped), t0()),
            Err(ApiError::InviteExhausted)
        ));
    }

    #[test]
    fn key_gate_runs_before_expiry_and_use_checks() {
        let db = db();
        let owner = seed_user(&db, "ada");
        let bob = seed_user(&db, "bob");
        let (realm_id, raw_key) = seed_realm(&db, owner, true);
        let raw_key = raw_key.unwrap();

        // Expired on purpose: the key gate must still answer first.
        let code = seed_invite(&db, realm_id, owner, None, Some(t0() - Duration::hours(1)));
        let req = |key: Option<&str>| JoinByCodeRequest {
            code: code.clone(),
            encryption_key: key.map(str::to_string),
        };

        assert!(matches!(
            join_by_code_at(&db, bob, &req(None), t0()),
            Err(ApiError::EncryptionKeyRequired)
        ));
        assert!(matches!(
            join_by_code_at(&db, bob, &req(Some("deadbeef")), t0()),
            Err(ApiError::InvalidEncryptionKey)
        ));
        assert!(matches!(
            join_by_code_at(&db, bob, &req(Some(&raw_key)), t0()),
            Err(ApiError::InviteExpired)
        ));
    }

    #[test]
    fn valid_key_admits_into_an_encrypted_realm() {
        let db = db();
        let owner = seed_user(&db, "ada");
        let bob = seed_user(&db, "bob");
        let (realm_id, raw_key) = seed_realm(&db, owner, true);
        let code = seed_invite(&db, realm_id, owner, None, None);

        let joined = join_by_code_at(
            &db,
            bob,
            &JoinByCodeRequest {
                code,
                encryption_key: raw_key,
            },
            t0(),
        )
        .unwrap();
        assert!(joined.success);
        assert!(
            db.is_realm_member(&realm_id.to_string(), &bob.to_string())
                .unwrap()
        );
    }
}
