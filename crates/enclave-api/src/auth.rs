use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{EncodingKey, Header, encode};
use uuid::Uuid;

use enclave_crypto::secret::{hash_secret, verify_secret};
use enclave_types::api::{Claims, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};

use crate::ApiState;
use crate::error::{ApiError, ApiResult};

pub async fn register(
    State(state): State<ApiState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.username.len() < 3 || req.username.len() > 32 {
        return Err(ApiError::Validation(
            "username must be 3-32 characters".to_string(),
        ));
    }
    if req.password.len() < 8 {
        return Err(ApiError::Validation(
            "password must be at least 8 characters".to_string(),
        ));
    }

    let existing = {
        let db = state.db.clone();
        let username = req.username.clone();
        tokio::task::spawn_blocking(move || db.get_user_by_username(&username)).await??
    };
    if existing.is_some() {
        return Err(ApiError::Conflict("username is taken".to_string()));
    }

    let password_hash = hash_secret(&req.password)?;
    let user_id = Uuid::new_v4();

    {
        let db = state.db.clone();
        let username = req.username.clone();
        tokio::task::spawn_blocking(move || {
            db.create_user(&user_id.to_string(), &username, &password_hash)
        })
        .await??;
    }

    let token = create_token(&state.jwt_secret, user_id, &req.username)?;

    Ok((StatusCode::CREATED, Json(RegisterResponse { user_id, token })))
}

pub async fn login(
    State(state): State<ApiState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let user = {
        let db = state.db.clone();
        let username = req.username.clone();
        tokio::task::spawn_blocking(move || db.get_user_by_username(&username)).await??
    }
    .ok_or(ApiError::Unauthorized)?;

    if !verify_secret(&req.password, &user.password_hash)? {
        return Err(ApiError::Unauthorized);
    }

    let user_id = Uuid::parse_str(&user.id).map_err(anyhow::Error::from)?;
    let token = create_token(&state.jwt_secret, user_id, &user.username)?;

    Ok(Json(LoginResponse {
        user_id,
        username: user.username,
        token,
    }))
}

fn create_token(secret: &str, user_id: Uuid, username: &str) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation, decode};

    #[test]
    fn tokens_round_trip_their_claims() {
        let user_id = Uuid::new_v4();
        let token = create_token("secret", user_id, "ada").unwrap();

        let data = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(b"secret"),
            &Validation::default(),
        )
        .unwrap();
        assert_eq!(data.claims.sub, user_id);
        assert_eq!(data.claims.username, "ada");
    }

    #[test]
    fn tokens_fail_against_the_wrong_secret() {
        let token = create_token("secret", Uuid::new_v4(), "ada").unwrap();
        let result = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(b"other"),
            &Validation::default(),
        );
        assert!(result.is_err());
    }
}
