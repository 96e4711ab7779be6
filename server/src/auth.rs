//! Auth token engine.
//!
//! Signs and verifies JSON web tokens on top of `jsonwebtoken`, and
//! classifies verification failures into the auth error variants of
//! [`ServerError`].

use std::fmt;

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::{Error as JwtError, ErrorKind};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_json::{Map, Value};

use crate::config::{AuthOptions, ConfigError};
use crate::error::ServerError;

/// A decoded auth token claim set.
pub type Claims = Map<String, Value>;

/// Per-call signing options.
#[derive(Debug, Clone, Default)]
pub struct SignOptions {
    /// Lifetime in seconds, overriding both the payload `exp` and the default.
    pub expires_in: Option<u64>,
    /// Seconds from now before the token becomes valid.
    pub not_before: Option<u64>,
}

impl SignOptions {
    /// Sets the token lifetime.
    #[must_use]
    pub fn with_expires_in(mut self, secs: u64) -> Self {
        self.expires_in = Some(secs);
        self
    }

    /// Sets the not-before delay.
    #[must_use]
    pub fn with_not_before(mut self, secs: u64) -> Self {
        self.not_before = Some(secs);
        self
    }
}

/// Signs and verifies auth tokens.
#[derive(Clone)]
pub struct AuthEngine {
    options: AuthOptions,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl fmt::Debug for AuthEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthEngine")
            .field("algorithm", &self.options.algorithm)
            .field("default_expiry", &self.options.default_expiry)
            .finish_non_exhaustive()
    }
}

impl AuthEngine {
    /// Creates an engine, generating a random secret if none is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid or a key cannot be parsed.
    pub fn new(options: AuthOptions) -> Result<Self, ConfigError> {
        let options = with_secret(options);
        options.validate()?;
        let (encoding, decoding) = derive_keys(&options)?;
        Ok(Self {
            options,
            encoding,
            decoding,
        })
    }

    /// Replaces the options and re-derives the key material.
    ///
    /// # Errors
    ///
    /// Returns an error if the new options are invalid. The engine is left
    /// unchanged in that case.
    pub fn update_options(&mut self, options: AuthOptions) -> Result<(), ConfigError> {
        *self = Self::new(options)?;
        Ok(())
    }

    /// Returns the effective options, including a generated secret.
    #[must_use]
    pub fn options(&self) -> &AuthOptions {
        &self.options
    }

    /// Signs a claim set.
    ///
    /// Adds `iat`, and `exp` unless the payload already carries one. An
    /// explicit `expires_in` always wins.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or a lifetime overflows the
    /// timestamp range.
    pub fn sign_token(&self, payload: Claims, options: &SignOptions) -> Result<String, ServerError> {
        self.sign_claims(payload, options).map(|(token, _)| token)
    }

    /// Signs a claim set and also returns the claims as signed.
    pub(crate) fn sign_claims(
        &self,
        mut claims: Claims,
        options: &SignOptions,
    ) -> Result<(String, Claims), ServerError> {
        let now = Utc::now().timestamp();
        claims.entry("iat").or_insert_with(|| Value::from(now));

        match options.expires_in {
            Some(secs) => {
                claims.insert("exp".to_string(), Value::from(offset(now, secs)?));
            }
            None => {
                if !claims.contains_key("exp") {
                    let exp = offset(now, self.options.default_expiry)?;
                    claims.insert("exp".to_string(), Value::from(exp));
                }
            }
        }

        if let Some(secs) = options.not_before {
            claims.insert("nbf".to_string(), Value::from(offset(now, secs)?));
        }

        let header = Header::new(self.options.algorithm);
        let token = encode(&header, &claims, &self.encoding)
            .map_err(|e| ServerError::AuthToken(e.to_string()))?;
        Ok((token, claims))
    }

    /// Verifies a token received over the wire.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArguments` if the value is not a string, otherwise one
    /// of the auth token error variants.
    pub fn verify_token(&self, token: &Value) -> Result<Claims, ServerError> {
        match token.as_str() {
            Some(token) => self.verify_signed_token(token),
            None => Err(ServerError::InvalidArguments(
                "Invalid token format - Token must be a string".to_string(),
            )),
        }
    }

    /// Verifies a signed token string.
    ///
    /// # Errors
    ///
    /// Returns the classified auth token error on failure.
    pub fn verify_signed_token(&self, token: &str) -> Result<Claims, ServerError> {
        decode::<Claims>(token, &self.decoding, &self.validation())
            .map(|data| data.claims)
            .map_err(|e| self.classify(token, e))
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(self.options.algorithm);
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.validate_nbf = true;
        validation.required_spec_claims.clear();
        validation
    }

    fn classify(&self, token: &str, error: JwtError) -> ServerError {
        match error.kind() {
            ErrorKind::ExpiredSignature => ServerError::AuthTokenExpired {
                message: "jwt expired".to_string(),
                expired_at: self.peek_timestamp(token, "exp").unwrap_or_default(),
            },
            ErrorKind::ImmatureSignature => ServerError::AuthTokenNotBefore {
                message: "jwt not active".to_string(),
                date: self.peek_timestamp(token, "nbf").unwrap_or_default(),
            },
            ErrorKind::InvalidToken
            | ErrorKind::InvalidSignature
            | ErrorKind::InvalidAlgorithm
            | ErrorKind::InvalidAlgorithmName
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_) => ServerError::AuthTokenInvalid(error.to_string()),
            _ => ServerError::AuthToken(error.to_string()),
        }
    }

    /// Reads a timestamp claim from a token whose signature is valid but
    /// whose time claims failed.
    fn peek_timestamp(&self, token: &str, claim: &str) -> Option<DateTime<Utc>> {
        let mut validation = self.validation();
        validation.validate_exp = false;
        validation.validate_nbf = false;
        let data = decode::<Claims>(token, &self.decoding, &validation).ok()?;
        let secs = data.claims.get(claim)?.as_f64()?;
        DateTime::from_timestamp(secs as i64, 0)
    }
}

/// Adds a lifetime in seconds to a unix timestamp.
fn offset(now: i64, secs: u64) -> Result<i64, ServerError> {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| now.checked_add(secs))
        .ok_or_else(|| ServerError::AuthToken("expiry out of range".to_string()))
}

fn with_secret(mut options: AuthOptions) -> AuthOptions {
    if options.secret_key.is_none() && !options.has_key_pair() {
        options.secret_key = Some(random_secret());
    }
    options
}

fn random_secret() -> String {
    let bytes: [u8; 32] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn derive_keys(options: &AuthOptions) -> Result<(EncodingKey, DecodingKey), ConfigError> {
    let invalid = |e: JwtError| ConfigError::InvalidKey(e.to_string());

    match (
        options.algorithm,
        options.private_key.as_deref(),
        options.public_key.as_deref(),
    ) {
        (Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512, _, _) => {
            let secret = options.secret_key.as_deref().unwrap_or_default().as_bytes();
            Ok((
                EncodingKey::from_secret(secret),
                DecodingKey::from_secret(secret),
            ))
        }
        (Algorithm::ES256 | Algorithm::ES384, Some(private), Some(public)) => Ok((
            EncodingKey::from_ec_pem(private.as_bytes()).map_err(invalid)?,
            DecodingKey::from_ec_pem(public.as_bytes()).map_err(invalid)?,
        )),
        (Algorithm::EdDSA, Some(private), Some(public)) => Ok((
            EncodingKey::from_ed_pem(private.as_bytes()).map_err(invalid)?,
            DecodingKey::from_ed_pem(public.as_bytes()).map_err(invalid)?,
        )),
        (_, Some(private), Some(public)) => Ok((
            EncodingKey::from_rsa_pem(private.as_bytes()).map_err(invalid)?,
            DecodingKey::from_rsa_pem(public.as_bytes()).map_err(invalid)?,
        )),
        _ => Err(ConfigError::IncompleteKeyPair),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use crate::config::MAX_TOKEN_EXPIRY_SECS;
    use tokio_test::{assert_err, assert_ok};

    fn engine(secret: &str) -> AuthEngine {
        AuthEngine::new(AuthOptions::with_secret(secret)).expect("engine")
    }

    fn payload() -> Claims {
        let mut claims = Claims::new();
        claims.insert("username".to_string(), json!("alice"));
        claims.insert("roles".to_string(), json!(["reader", "writer"]));
        claims
    }

    #[test]
    fn test_sign_and_verify_round_trip() {
        let engine = engine("s3cret");
        let token = engine
            .sign_token(payload(), &SignOptions::default())
            .expect("sign");

        let claims = engine.verify_signed_token(&token).expect("verify");
        assert_eq!(claims.get("username"), Some(&json!("alice")));
        assert_eq!(claims.get("roles"), Some(&json!(["reader", "writer"])));

        let iat = claims.get("iat").and_then(Value::as_i64).expect("iat");
        let exp = claims.get("exp").and_then(Value::as_i64).expect("exp");
        assert_eq!(exp - iat, 86_400);

        let mut expected = payload();
        expected.insert("iat".to_string(), json!(iat));
        expected.insert("exp".to_string(), json!(exp));
        assert_eq!(claims, expected);
    }

    #[test]
    fn test_wrong_secret_is_invalid() {
        let token = engine("one")
            .sign_token(payload(), &SignOptions::default())
            .expect("sign");

        let err = engine("two")
            .verify_signed_token(&token)
            .expect_err("must fail");
        assert!(matches!(err, ServerError::AuthTokenInvalid(_)));
        assert!(err.is_bad_auth_token());
    }

    #[test]
    fn test_expired_token_reports_expiry() {
        let engine = engine("s3cret");
        let exp = Utc::now().timestamp() - 30;
        let mut claims = payload();
        claims.insert("exp".to_string(), json!(exp));

        let token = engine
            .sign_token(claims, &SignOptions::default())
            .expect("sign");
        match engine.verify_signed_token(&token) {
            Err(ServerError::AuthTokenExpired { expired_at, .. }) => {
                assert_eq!(expired_at.timestamp(), exp);
            }
            other => panic!("expected expired error, got {other:?}"),
        }
    }

    #[test]
    fn test_not_before_classification() {
        let engine = engine("s3cret");
        let token = engine
            .sign_token(payload(), &SignOptions::default().with_not_before(60))
            .expect("sign");

        let err = engine.verify_signed_token(&token).expect_err("must fail");
        assert!(matches!(err, ServerError::AuthTokenNotBefore { .. }));
    }

    #[test]
    fn test_payload_exp_is_kept() {
        let engine = engine("s3cret");
        let exp = Utc::now().timestamp() + 120;
        let mut claims = payload();
        claims.insert("exp".to_string(), json!(exp));

        let (_, signed) = engine
            .sign_claims(claims, &SignOptions::default())
            .expect("sign");
        assert_eq!(signed.get("exp"), Some(&json!(exp)));
    }

    #[test]
    fn test_expires_in_overrides_payload_exp() {
        let engine = engine("s3cret");
        let mut claims = payload();
        claims.insert("exp".to_string(), json!(1));

        let (_, signed) = engine
            .sign_claims(claims, &SignOptions::default().with_expires_in(10))
            .expect("sign");
        let iat = signed.get("iat").and_then(Value::as_i64).expect("iat");
        assert_eq!(signed.get("exp"), Some(&json!(iat + 10)));
    }

    #[test]
    fn test_non_string_token_is_invalid_arguments() {
        let err = engine("s3cret")
            .verify_token(&json!(42))
            .expect_err("must fail");
        assert!(matches!(err, ServerError::InvalidArguments(_)));
        assert!(!err.is_bad_auth_token());
    }

    #[test]
    fn test_malformed_token_is_invalid() {
        let err = engine("s3cret")
            .verify_signed_token("not.a.token")
            .expect_err("must fail");
        assert!(err.is_bad_auth_token());
    }

    #[test]
    fn test_generated_secret() {
        let engine = AuthEngine::new(AuthOptions::default()).expect("engine");
        let secret = engine.options().secret_key.clone().expect("secret");
        assert_eq!(secret.len(), 64);

        let token = engine
            .sign_token(payload(), &SignOptions::default())
            .expect("sign");
        assert_ok!(engine.verify_signed_token(&token));
    }

    #[test]
    fn test_oversized_lifetimes_are_errors() {
        let engine = engine("s3cret");
        let err = engine
            .sign_token(
                payload(),
                &SignOptions::default().with_expires_in(i64::MAX as u64),
            )
            .expect_err("must fail");
        assert!(matches!(err, ServerError::AuthToken(_)));

        let err = engine
            .sign_token(payload(), &SignOptions::default().with_expires_in(u64::MAX))
            .expect_err("must fail");
        assert!(matches!(err, ServerError::AuthToken(_)));

        let err = engine
            .sign_token(payload(), &SignOptions::default().with_not_before(u64::MAX))
            .expect_err("must fail");
        assert!(matches!(err, ServerError::AuthToken(_)));
    }

    #[test]
    fn test_oversized_default_expiry_rejected() {
        let options = AuthOptions::with_secret("s3cret").with_default_expiry(u64::MAX / 2);
        assert!(matches!(
            AuthEngine::new(options),
            Err(ConfigError::InvalidDefaultExpiry)
        ));

        let options =
            AuthOptions::with_secret("s3cret").with_default_expiry(MAX_TOKEN_EXPIRY_SECS);
        let engine = assert_ok!(AuthEngine::new(options));
        assert_ok!(engine.sign_token(payload(), &SignOptions::default()));
    }

    #[test]
    fn test_half_key_pair_rejected() {
        let mut options = AuthOptions::default().with_algorithm(Algorithm::RS256);
        options.public_key = Some("public".to_string());
        assert!(matches!(
            AuthEngine::new(options),
            Err(ConfigError::IncompleteKeyPair)
        ));
    }

    #[test]
    fn test_update_options_rederives_keys() {
        let mut engine = engine("one");
        let old = engine
            .sign_token(payload(), &SignOptions::default())
            .expect("sign");

        engine
            .update_options(AuthOptions::with_secret("two"))
            .expect("update");
        assert_err!(engine.verify_signed_token(&old));
    }
}
