use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use lms_core::{UserId, UserIdentity};
use lms_error::{LmsError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AuthConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub sub: String,        // subject (user ID)
    pub user_id: String,    // user ID
    pub email: String,      // email
    pub roles: Vec<String>, // role names at issuance
    pub iat: i64,           // issued at timestamp
    pub exp: i64,           // expiration timestamp
    pub iss: String,        // issuer
    pub aud: String,        // audience
    pub jti: String,        // JWT ID
    pub typ: TokenKind,     // token type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_id: Option<String>, // refresh token generation
}

impl Claims {
    fn new(
        identity: &UserIdentity,
        config: &AuthConfig,
        typ: TokenKind,
        issued_at: DateTime<Utc>,
        ttl: Duration,
        rotation_id: Option<String>,
    ) -> Self {
        let user_id = identity.id().to_string();
        Self {
            sub: user_id.clone(),
            user_id,
            email: identity.email().to_string(),
            roles: identity.role_names(),
            iat: issued_at.timestamp(),
            exp: (issued_at + ttl).timestamp(),
            iss: config.issuer.clone(),
            aud: config.audience.clone(),
            jti: Uuid::new_v4().to_string(),
            typ,
            rotation_id,
        }
    }

    pub fn user_id(&self) -> Result<UserId> {
        UserId::parse(&self.user_id).map_err(|_| LmsError::TokenMalformed {
            reason: "invalid user id claim".to_string(),
        })
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or_else(Utc::now)
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.iat, 0).unwrap_or_else(Utc::now)
    }

    /// exp 为开区间：恰好到达 exp 时已过期
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.exp
    }

    pub fn is_access_token(&self) -> bool {
        self.typ == TokenKind::Access
    }

    pub fn is_refresh_token(&self) -> bool {
        self.typ == TokenKind::Refresh
    }
}

/// 签发的访问令牌
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// 签发的刷新令牌，rotation_id 需由调用方持久化
#[derive(Debug, Clone)]
pub struct IssuedRefreshToken {
    pub token: String,
    pub rotation_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access: IssuedToken,
    pub refresh: IssuedRefreshToken,
}

/// 常量时间比较轮换标识
pub fn rotation_matches(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub struct TokenService {
    config: AuthConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenService {
    pub fn new(config: AuthConfig) -> Result<Self> {
        config.validate()?;

        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_audience(&[config.audience.as_str()]);
        // 过期检查由我们自己做（开区间，无 leeway）
        validation.validate_exp = false;
        validation.leeway = 0;

        Ok(Self {
            config,
            encoding_key,
            decoding_key,
            validation,
        })
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    fn access_ttl(&self) -> Duration {
        Duration::minutes(self.config.access_ttl_minutes)
    }

    fn refresh_ttl(&self) -> Duration {
        Duration::days(self.config.refresh_ttl_days)
    }

    fn sign(&self, claims: &Claims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key).map_err(|e| {
            LmsError::TokenIssuance {
                message: format!("Failed to sign {:?} token: {}", claims.typ, e),
            }
        })
    }

    /// 生成访问令牌
    pub fn issue_access_token(&self, identity: &UserIdentity) -> Result<IssuedToken> {
        self.issue_access_token_at(identity, Utc::now())
    }

    pub fn issue_access_token_at(
        &self,
        identity: &UserIdentity,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken> {
        let claims = Claims::new(
            identity,
            &self.config,
            TokenKind::Access,
            now,
            self.access_ttl(),
            None,
        );
        let token = self.sign(&claims)?;
        Ok(IssuedToken {
            token,
            expires_at: claims.expires_at(),
        })
    }

    /// 生成刷新令牌，附带新的轮换标识
    pub fn issue_refresh_token(&self, identity: &UserIdentity) -> Result<IssuedRefreshToken> {
        self.issue_refresh_token_at(identity, Utc::now())
    }

    pub fn issue_refresh_token_at(
        &self,
        identity: &UserIdentity,
        now: DateTime<Utc>,
    ) -> Result<IssuedRefreshToken> {
        let rotation_id = Uuid::new_v4().simple().to_string();
        let claims = Claims::new(
            identity,
            &self.config,
            TokenKind::Refresh,
            now,
            self.refresh_ttl(),
            Some(rotation_id.clone()),
        );
        let token = self.sign(&claims)?;
        Ok(IssuedRefreshToken {
            token,
            rotation_id,
            expires_at: claims.expires_at(),
        })
    }

    /// 生成Token对
    pub fn issue_token_pair(&self, identity: &UserIdentity) -> Result<TokenPair> {
        let now = Utc::now();
        Ok(TokenPair {
            access: self.issue_access_token_at(identity, now)?,
            refresh: self.issue_refresh_token_at(identity, now)?,
        })
    }

    /// 验证签名并解码，不检查类型
    fn decode_at(&self, token: &str, now: DateTime<Utc>) -> Result<Claims> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => LmsError::TokenInvalidSignature,
                ErrorKind::ExpiredSignature => LmsError::TokenExpired,
                _ => LmsError::TokenMalformed {
                    reason: e.to_string(),
                },
            })?;

        if claims.is_expired_at(now) {
            return Err(LmsError::TokenExpired);
        }
        Ok(claims)
    }

    /// 验证访问令牌
    pub fn validate_access_token(&self, token: &str) -> Result<Claims> {
        self.validate_access_token_at(token, Utc::now())
    }

    pub fn validate_access_token_at(&self, token: &str, now: DateTime<Utc>) -> Result<Claims> {
        let claims = self.decode_at(token, now)?;
        if !claims.is_access_token() {
            return Err(LmsError::TokenMalformed {
                reason: "not an access token".to_string(),
            });
        }
        Ok(claims)
    }

    /// 解码刷新令牌但不比对轮换标识，用于先读取用户再取期望值
    pub fn decode_refresh_token(&self, token: &str) -> Result<Claims> {
        let claims = self.decode_at(token, Utc::now())?;
        if !claims.is_refresh_token() || claims.rotation_id.is_none() {
            return Err(LmsError::TokenMalformed {
                reason: "not a refresh token".to_string(),
            });
        }
        Ok(claims)
    }

    /// 验证刷新令牌，并与期望的轮换标识做常量时间比较
    pub fn validate_refresh_token(&self, token: &str, expected_rotation_id: &str) -> Result<Claims> {
        self.validate_refresh_token_at(token, expected_rotation_id, Utc::now())
    }

    pub fn validate_refresh_token_at(
        &self,
        token: &str,
        expected_rotation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Claims> {
        let claims = self.decode_at(token, now)?;
        let presented = match (&claims.typ, &claims.rotation_id) {
            (TokenKind::Refresh, Some(rotation_id)) => rotation_id,
            _ => {
                return Err(LmsError::TokenMalformed {
                    reason: "not a refresh token".to_string(),
                })
            }
        };

        if !rotation_matches(presented, expected_rotation_id) {
            return Err(LmsError::TokenRotationMismatch);
        }
        Ok(claims)
    }

    /// 从Authorization header中提取token
    pub fn extract_bearer(authorization: &str) -> Option<&str> {
        authorization
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lms_core::{Email, PasswordHash, RoleName};

    const SECRET: &str = "test_secret_key_123456789_abcdefghij";

    fn service() -> TokenService {
        TokenService::new(AuthConfig::new(SECRET)).unwrap()
    }

    fn identity(roles: &[&str]) -> UserIdentity {
        let mut user = UserIdentity::register(
            Email::parse("learner@example.com").unwrap(),
            PasswordHash::from_hash("hash"),
            None,
        );
        for role in roles {
            user.assign_role(RoleName::parse(role).unwrap());
        }
        user
    }

    fn fixed_now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_access_token_round_trip() {
        let service = service();
        let user = identity(&["editor", "student"]);

        let issued = service.issue_access_token(&user).unwrap();
        let claims = service.validate_access_token(&issued.token).unwrap();

        assert_eq!(claims.user_id().unwrap(), user.id());
        assert_eq!(claims.email, "learner@example.com");
        assert_eq!(claims.roles, vec!["editor".to_string(), "student".to_string()]);
        assert!(claims.is_access_token());
        assert_eq!(claims.expires_at(), issued.expires_at);
        assert!(claims.rotation_id.is_none());
    }

    #[test]
    fn test_wire_format_uses_camel_case_claims() {
        let service = service();
        let user = identity(&[]);
        let issued = service.issue_refresh_token(&user).unwrap();

        let segments: Vec<&str> = issued.token.split('.').collect();
        assert_eq!(segments.len(), 3);

        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_aud = false;
        let raw = decode::<serde_json::Value>(&issued.token, &DecodingKey::from_secret(b"x"), &validation)
            .unwrap()
            .claims;
        assert_eq!(raw["userId"], user.id().to_string());
        assert_eq!(raw["rotationId"], issued.rotation_id);
        assert!(raw["roles"].is_array());
    }

    #[test]
    fn test_expiry_boundary_is_exclusive() {
        let service = service();
        let user = identity(&[]);
        let now = fixed_now();
        let issued = service.issue_access_token_at(&user, now).unwrap();

        let just_before = issued.expires_at - Duration::seconds(1);
        assert!(service.validate_access_token_at(&issued.token, just_before).is_ok());

        let at_exp = issued.expires_at;
        assert_eq!(
            service.validate_access_token_at(&issued.token, at_exp).unwrap_err(),
            LmsError::TokenExpired
        );
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let service = service();
        let other = TokenService::new(AuthConfig::new("another_secret_key_0123456789abcdef")).unwrap();
        let user = identity(&[]);

        let forged = other.issue_access_token(&user).unwrap();
        assert_eq!(
            service.validate_access_token(&forged.token).unwrap_err(),
            LmsError::TokenInvalidSignature
        );
    }

    #[test]
    fn test_malformed_tokens_rejected() {
        let service = service();
        for bad in ["", "abc", "a.b.c", "eyJhbGciOiJIUzI1NiJ9.e30"] {
            assert!(matches!(
                service.validate_access_token(bad),
                Err(LmsError::TokenMalformed { .. })
            ));
        }
    }

    #[test]
    fn test_token_kinds_not_interchangeable() {
        let service = service();
        let user = identity(&[]);
        let pair = service.issue_token_pair(&user).unwrap();

        assert!(matches!(
            service.validate_access_token(&pair.refresh.token),
            Err(LmsError::TokenMalformed { .. })
        ));
        assert!(matches!(
            service.validate_refresh_token(&pair.access.token, "whatever"),
            Err(LmsError::TokenMalformed { .. })
        ));
    }

    #[test]
    fn test_refresh_rotation_check() {
        let service = service();
        let user = identity(&[]);
        let issued = service.issue_refresh_token(&user).unwrap();

        let claims = service
            .validate_refresh_token(&issued.token, &issued.rotation_id)
            .unwrap();
        assert_eq!(claims.rotation_id.as_deref(), Some(issued.rotation_id.as_str()));

        assert_eq!(
            service
                .validate_refresh_token(&issued.token, "stale-rotation")
                .unwrap_err(),
            LmsError::TokenRotationMismatch
        );
    }

    #[test]
    fn test_expired_refresh_token() {
        let service = service();
        let user = identity(&[]);
        let now = fixed_now();
        let issued = service.issue_refresh_token_at(&user, now).unwrap();
        assert_eq!(
            service
                .validate_refresh_token_at(&issued.token, &issued.rotation_id, issued.expires_at)
                .unwrap_err(),
            LmsError::TokenExpired
        );
    }

    #[test]
    fn test_missing_secret_fails_construction() {
        let err = TokenService::new(AuthConfig::default()).err().unwrap();
        assert!(matches!(err, LmsError::TokenIssuance { .. }));
    }

    #[test]
    fn test_oversized_ttl_fails_construction() {
        let mut config = AuthConfig::new(SECRET);
        config.access_ttl_minutes = i64::MAX / 60;
        let err = TokenService::new(config).err().unwrap();
        assert!(matches!(err, LmsError::Configuration { .. }));
    }

    #[test]
    fn test_foreign_algorithm_is_malformed() {
        let service = service();
        let user = identity(&[]);
        let issued = service.issue_access_token(&user).unwrap();
        let claims = service.validate_access_token(&issued.token).unwrap();

        let foreign = encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert!(matches!(
            service.validate_access_token(&foreign),
            Err(LmsError::TokenMalformed { .. })
        ));
    }

    #[test]
    fn test_extract_bearer() {
        assert_eq!(TokenService::extract_bearer("Bearer abc.def.ghi"), Some("abc.def.ghi"));
        assert_eq!(TokenService::extract_bearer("Basic dXNlcjpwYXNz"), None);
        assert_eq!(TokenService::extract_bearer("Bearer "), None);
    }

    #[test]
    fn test_rotation_matches_constant_time_helper() {
        assert!(rotation_matches("abc", "abc"));
        assert!(!rotation_matches("abc", "abd"));
        assert!(!rotation_matches("abc", "abcd"));
    }
}
