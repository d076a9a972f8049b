//! Bearer token verification.
//!
//! The gate turns an `Authorization` header into an [`Identity`] or nothing.
//! It never fails loudly: a missing, malformed, forged or expired credential
//! simply yields `None` and the permission table decides what that means for
//! the requested operation.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }

    /// Admin satisfies every role requirement.
    pub fn satisfies(self, required: Role) -> bool {
        self == Role::Admin || self == required
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// The verified subject of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    #[serde(rename = "id")]
    pub subject_id: String,
    pub email: String,
    pub role: Role,
}

/// Wire form of the token payload.  `id` is what the site's login flow
/// writes; `sub` is accepted for tokens minted by standard tooling.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    #[serde(alias = "sub")]
    id: String,
    email: String,
    role: String,
    exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iat: Option<i64>,
}

#[derive(Clone)]
pub struct AuthGate {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
}

impl fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthGate").finish_non_exhaustive()
    }
}

impl AuthGate {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Resolve the identity carried by an `Authorization` header value.
    pub fn identify(&self, header: Option<&str>) -> Option<Identity> {
        let raw = header?;
        let parts: Vec<&str> = raw.split(' ').collect();
        if parts.len() != 2 || parts[0] != "Bearer" {
            tracing::debug!("authorization header is not of the form 'Bearer <token>'");
            return None;
        }
        self.verify(parts[1])
    }

    /// Verify a raw token (signature and expiry).
    pub fn verify(&self, token: &str) -> Option<Identity> {
        let data = match decode::<Claims>(token, &self.decoding, &self.validation) {
            Ok(data) => data,
            Err(err) => {
                tracing::debug!(error = %err, "token verification failed");
                return None;
            }
        };
        let claims = data.claims;
        let role = match claims.role.parse::<Role>() {
            Ok(role) => role,
            Err(err) => {
                tracing::debug!(error = %err, "token carries an unusable role");
                return None;
            }
        };
        Some(Identity {
            subject_id: claims.id,
            email: claims.email,
            role,
        })
    }

    /// Issue a token for `identity` that expires after `ttl`.
    pub fn sign(&self, identity: &Identity, ttl: Duration) -> Result<String, jsonwebtoken::errors::Error> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            id: identity.subject_id.clone(),
            email: identity.email.clone(),
            role: identity.role.as_str().to_string(),
            exp: now + ttl.as_secs() as i64,
            iat: Some(now),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Identity {
        Identity {
            subject_id: "65f0c0ffee".into(),
            email: "alice@example.com".into(),
            role: Role::User,
        }
    }

    fn forge(secret: &str, claims: serde_json::Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn accepts_signed_bearer_token() {
        let gate = AuthGate::new("s3cret");
        let token = gate.sign(&alice(), Duration::from_secs(3600)).unwrap();
        let header = format!("Bearer {}", token);
        assert_eq!(gate.identify(Some(&header)), Some(alice()));
    }

    #[test]
    fn rejects_missing_and_malformed_headers() {
        let gate = AuthGate::new("s3cret");
        let token = gate.sign(&alice(), Duration::from_secs(3600)).unwrap();
        assert!(gate.identify(None).is_none());
        assert!(gate.identify(Some("")).is_none());
        assert!(gate.identify(Some(&token)).is_none());
        assert!(gate.identify(Some(&format!("bearer {}", token))).is_none());
        assert!(gate.identify(Some(&format!("Token {}", token))).is_none());
        assert!(gate.identify(Some(&format!("Bearer {} extra", token))).is_none());
        assert!(gate.identify(Some(&format!("Bearer  {}", token))).is_none());
    }

    #[test]
    fn rejects_foreign_signature() {
        let gate = AuthGate::new("s3cret");
        let other = AuthGate::new("different");
        let token = other.sign(&alice(), Duration::from_secs(3600)).unwrap();
        assert!(gate.verify(&token).is_none());
    }

    #[test]
    fn rejects_expired_token() {
        let now = chrono::Utc::now().timestamp();
        let token = forge(
            "s3cret",
            serde_json::json!({"id": "u1", "email": "a@b.c", "role": "user", "exp": now - 60}),
        );
        assert!(AuthGate::new("s3cret").verify(&token).is_none());
    }

    #[test]
    fn role_is_case_insensitive_and_sub_is_accepted() {
        let exp = chrono::Utc::now().timestamp() + 600;
        let token = forge(
            "s3cret",
            serde_json::json!({"sub": "u9", "email": "root@b.c", "role": "ADMIN", "exp": exp}),
        );
        let identity = AuthGate::new("s3cret").verify(&token).unwrap();
        assert_eq!(identity.subject_id, "u9");
        assert_eq!(identity.role, Role::Admin);
    }

    #[test]
    fn unknown_role_is_rejected() {
        let exp = chrono::Utc::now().timestamp() + 600;
        let token = forge(
            "s3cret",
            serde_json::json!({"id": "u1", "email": "a@b.c", "role": "editor", "exp": exp}),
        );
        assert!(AuthGate::new("s3cret").verify(&token).is_none());
    }

    #[test]
    fn admin_satisfies_any_role() {
        assert!(Role::Admin.satisfies(Role::User));
        assert!(Role::Admin.satisfies(Role::Admin));
        assert!(Role::User.satisfies(Role::User));
        assert!(!Role::User.satisfies(Role::Admin));
    }
}
