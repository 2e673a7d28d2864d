//! Request authentication: api-key and bearer-token principals, an admin
//! set, and optional per-principal rate limiting.

use crate::errors::{ApiError, ErrorKind};
use axum::http::HeaderMap;
use chrono::Utc;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMode {
    ApiKey,
    Bearer,
    Hybrid,
}

impl FromStr for AuthMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "api_key" | "api-key" => Ok(AuthMode::ApiKey),
            "bearer" | "bearer_token" => Ok(AuthMode::Bearer),
            "hybrid" => Ok(AuthMode::Hybrid),
            other => anyhow::bail!("unsupported auth mode: {}", other),
        }
    }
}

/// The resolved caller of a request.
#[derive(Clone, Debug)]
pub struct AuthUser {
    pub user_id: String,
    pub is_admin: bool,
}

#[derive(Deserialize)]
struct Claims {
    sub: String,
    #[allow(dead_code)]
    exp: usize,
}

struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

/// Resolves principals from request headers and enforces the per-principal
/// request rate.
pub struct Authenticator {
    mode: AuthMode,
    api_keys: HashMap<String, String>,
    admin_ids: HashSet<String>,
    rate_limit_per_minute: u32,
    rate_windows: Mutex<HashMap<String, (i64, u32)>>,
    jwt: Option<JwtVerifier>,
}

impl Authenticator {
    pub fn new(
        mode: AuthMode,
        api_key_mappings: &str,
        admin_user_ids: &str,
        rate_limit_per_minute: u32,
        jwt_secret: &str,
        jwt_algorithm: &str,
        jwt_audience: &str,
        jwt_issuer: &str,
    ) -> anyhow::Result<Self> {
        let jwt = if matches!(mode, AuthMode::Bearer | AuthMode::Hybrid) {
            if jwt_secret.is_empty() {
                anyhow::bail!("token secret must be set for bearer auth");
            }
            let algorithm = Algorithm::from_str(jwt_algorithm)
                .map_err(|_| anyhow::anyhow!("unsupported token algorithm: {}", jwt_algorithm))?;
            let mut validation = Validation::new(algorithm);
            if jwt_audience.is_empty() {
                validation.validate_aud = false;
            } else {
                validation.set_audience(&[jwt_audience]);
            }
            if !jwt_issuer.is_empty() {
                validation.set_issuer(&[jwt_issuer]);
            }
            Some(JwtVerifier {
                decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
                validation,
            })
        } else {
            None
        };

        Ok(Self {
            mode,
            api_keys: parse_api_key_mappings(api_key_mappings),
            admin_ids: admin_user_ids
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            rate_limit_per_minute,
            rate_windows: Mutex::new(HashMap::new()),
            jwt,
        })
    }

    /// Resolve the caller or fail with 401/403/429.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<AuthUser, ApiError> {
        let user = match self.mode {
            AuthMode::ApiKey => self.from_api_key(headers)?,
            AuthMode::Bearer => self.from_bearer(headers)?,
            AuthMode::Hybrid => match self.from_api_key(headers) {
                Ok(user) => user,
                Err(err) if err.kind == ErrorKind::Auth => self.from_bearer(headers)?,
                Err(err) => return Err(err),
            },
        };
        self.check_rate(&user.user_id)?;
        Ok(user)
    }

    /// Same as `authenticate`, then require admin membership.
    pub fn authenticate_admin(&self, headers: &HeaderMap) -> Result<AuthUser, ApiError> {
        let user = self.authenticate(headers)?;
        if !user.is_admin {
            return Err(ApiError::forbidden("admin access required"));
        }
        Ok(user)
    }

    fn from_api_key(&self, headers: &HeaderMap) -> Result<AuthUser, ApiError> {
        let api_key = headers
            .get("X-API-Key")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::auth("missing API key"))?;
        let user_id = self
            .api_keys
            .get(api_key)
            .ok_or_else(|| ApiError::forbidden("invalid API key"))?;
        Ok(self.user(user_id))
    }

    fn from_bearer(&self, headers: &HeaderMap) -> Result<AuthUser, ApiError> {
        let verifier = self
            .jwt
            .as_ref()
            .ok_or_else(|| ApiError::auth("bearer auth is not configured"))?;
        let header = headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::auth("missing bearer token"))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::auth("malformed authorization header"))?;

        let claims =
            decode::<Claims>(token.trim(), &verifier.decoding_key, &verifier.validation)
                .map_err(|err| ApiError::forbidden(format!("invalid token: {}", err)))?
                .claims;
        Ok(self.user(&claims.sub))
    }

    fn user(&self, user_id: &str) -> AuthUser {
        AuthUser {
            user_id: user_id.to_string(),
            is_admin: self.admin_ids.contains(user_id),
        }
    }

    /// Fixed-window rate limiting keyed by principal.
    fn check_rate(&self, user_id: &str) -> Result<(), ApiError> {
        if self.rate_limit_per_minute == 0 {
            return Ok(());
        }
        let minute = Utc::now().timestamp() / 60;
        let mut windows = self.rate_windows.lock().unwrap();
        let entry = windows.entry(user_id.to_string()).or_insert((minute, 0));
        if entry.0 != minute {
            *entry = (minute, 0);
        }
        if entry.1 >= self.rate_limit_per_minute {
            return Err(ApiError::new(
                ErrorKind::RateLimited,
                "request rate limit reached",
            ));
        }
        entry.1 += 1;
        Ok(())
    }
}

fn parse_api_key_mappings(raw: &str) -> HashMap<String, String> {
    let mut mapping = HashMap::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        let Some((api_key, user_id)) = pair.split_once(':') else {
            continue;
        };
        let api_key = api_key.trim();
        let user_id = user_id.trim();
        if !api_key.is_empty() && !user_id.is_empty() {
            mapping.insert(api_key.to_string(), user_id.to_string());
        }
    }
    mapping
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn api_key_auth(rate: u32) -> Authenticator {
        Authenticator::new(
            AuthMode::ApiKey,
            "dev-key:dev-user, admin-key:admin-user",
            "admin-user",
            rate,
            "",
            "HS256",
            "",
            "",
        )
        .unwrap()
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_str(name).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn api_key_resolves_principal_and_admin_flag() {
        let auth = api_key_auth(0);
        let user = auth.authenticate(&headers(&[("X-API-Key", "dev-key")])).unwrap();
        assert_eq!(user.user_id, "dev-user");
        assert!(!user.is_admin);

        let admin = auth
            .authenticate_admin(&headers(&[("X-API-Key", "admin-key")]))
            .unwrap();
        assert!(admin.is_admin);
    }

    #[test]
    fn missing_key_is_401_and_unknown_key_is_403() {
        let auth = api_key_auth(0);
        let missing = auth.authenticate(&HeaderMap::new()).unwrap_err();
        assert_eq!(missing.kind, ErrorKind::Auth);
        let unknown = auth
            .authenticate(&headers(&[("X-API-Key", "nope")]))
            .unwrap_err();
        assert_eq!(unknown.kind, ErrorKind::Forbidden);
    }

    #[test]
    fn non_admin_cannot_reach_admin_surface() {
        let auth = api_key_auth(0);
        let err = auth
            .authenticate_admin(&headers(&[("X-API-Key", "dev-key")]))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Forbidden);
    }

    #[test]
    fn rate_limit_kicks_in_within_one_window() {
        let auth = api_key_auth(2);
        let h = headers(&[("X-API-Key", "dev-key")]);
        assert!(auth.authenticate(&h).is_ok());
        assert!(auth.authenticate(&h).is_ok());
        let err = auth.authenticate(&h).unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimited);
    }

    #[test]
    fn bearer_token_resolves_subject() {
        let auth = Authenticator::new(
            AuthMode::Bearer,
            "",
            "jwt-admin",
            0,
            "top-secret",
            "HS256",
            "",
            "",
        )
        .unwrap();

        let exp = (Utc::now().timestamp() + 600) as usize;
        let token = encode(
            &Header::default(),
            &json!({"sub": "jwt-user", "exp": exp}),
            &EncodingKey::from_secret(b"top-secret"),
        )
        .unwrap();

        let user = auth
            .authenticate(&headers(&[("Authorization", &format!("Bearer {}", token))]))
            .unwrap();
        assert_eq!(user.user_id, "jwt-user");
        assert!(!user.is_admin);

        let bad = auth
            .authenticate(&headers(&[("Authorization", "Bearer garbage")]))
            .unwrap_err();
        assert_eq!(bad.kind, ErrorKind::Forbidden);
    }

    #[test]
    fn hybrid_accepts_either_credential() {
        let auth = Authenticator::new(
            AuthMode::Hybrid,
            "dev-key:dev-user",
            "",
            0,
            "top-secret",
            "HS256",
            "",
            "",
        )
        .unwrap();

        assert!(auth.authenticate(&headers(&[("X-API-Key", "dev-key")])).is_ok());

        let exp = (Utc::now().timestamp() + 600) as usize;
        let token = encode(
            &Header::default(),
            &json!({"sub": "jwt-user", "exp": exp}),
            &EncodingKey::from_secret(b"top-secret"),
        )
        .unwrap();
        assert!(auth
            .authenticate(&headers(&[("Authorization", &format!("Bearer {}", token))]))
            .is_ok());
    }
}
