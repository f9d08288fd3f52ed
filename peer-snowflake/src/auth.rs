use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use jsonwebtoken::{encode as jwt_encode, Algorithm, EncodingKey, Header};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey};
use rsa::RsaPrivateKey;
use secrecy::SecretString;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

#[derive(Debug, Serialize)]
struct JwtClaims {
    iss: String,
    sub: String,
    iat: u64,
    exp: u64,
}

/// Key-pair JWT authentication for the Snowflake SQL API. Tokens are
/// refreshed before they expire and never logged.
#[derive(Clone)]
pub struct SnowflakeAuth {
    account_id: String,
    normalized_account_id: String,
    username: String,
    private_key: RsaPrivateKey,
    public_key_fp: String,
    refresh_threshold: u64,
    expiry_threshold: u64,
    last_refreshed: u64,
    current_jwt: Option<SecretString>,
}

impl SnowflakeAuth {
    #[tracing::instrument(name = "peer_sflake::init_client_auth", skip_all)]
    pub fn new(
        account_id: String,
        username: String,
        private_key: &str,
        password: Option<&str>,
        refresh_threshold: u64,
        expiry_threshold: u64,
    ) -> anyhow::Result<Self> {
        let pkey: RsaPrivateKey = match password {
            Some(pw) => RsaPrivateKey::from_pkcs8_encrypted_pem(private_key, pw)
                .context("Invalid private key or decryption failed")?,
            None => RsaPrivateKey::from_pkcs8_pem(private_key).context("Invalid private key")?,
        };
        let public_key_fp = Self::gen_public_key_fp(&pkey)?;
        let mut auth = SnowflakeAuth {
            normalized_account_id: Self::normalize_account_identifier(&account_id),
            account_id,
            username,
            private_key: pkey,
            public_key_fp,
            refresh_threshold,
            expiry_threshold,
            last_refreshed: 0,
            current_jwt: None,
        };
        auth.refresh_jwt()?;
        Ok(auth)
    }

    // Normalize the account identifier to the form embedded into the JWT,
    // following Snowflake's reference implementation for key-pair auth.
    fn normalize_account_identifier(raw_account: &str) -> String {
        let split_index = if !raw_account.contains(".global") {
            *raw_account
                .find('.')
                .get_or_insert(raw_account.chars().count())
        } else {
            *raw_account
                .find('-')
                .get_or_insert(raw_account.chars().count())
        };
        raw_account
            .chars()
            .flat_map(char::to_uppercase)
            .take(split_index)
            .collect()
    }

    fn gen_public_key_fp(private_key: &RsaPrivateKey) -> anyhow::Result<String> {
        let public_key = private_key.to_public_key().to_public_key_der()?;
        Ok(format!(
            "SHA256:{}",
            BASE64_STANDARD.encode(Sha256::new_with_prefix(public_key.as_bytes()).finalize())
        ))
    }

    #[tracing::instrument(name = "peer_sflake::auth_refresh_jwt", skip_all)]
    fn refresh_jwt(&mut self) -> anyhow::Result<()> {
        let private_key_jwt: EncodingKey =
            EncodingKey::from_rsa_der(self.private_key.to_pkcs1_der()?.as_bytes());
        self.last_refreshed = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        info!(
            "refreshing JWT for account {} and user {}",
            self.account_id, self.username
        );
        let claims = JwtClaims {
            iss: format!(
                "{}.{}.{}",
                self.normalized_account_id,
                self.username.to_uppercase(),
                self.public_key_fp
            ),
            sub: format!(
                "{}.{}",
                self.normalized_account_id,
                self.username.to_uppercase()
            ),
            iat: self.last_refreshed,
            exp: self.last_refreshed + self.expiry_threshold,
        };

        let encoded_jwt = jwt_encode(&Header::new(Algorithm::RS256), &claims, &private_key_jwt)?;
        self.current_jwt = Some(SecretString::from(encoded_jwt));
        Ok(())
    }

    pub fn get_jwt(&mut self) -> anyhow::Result<&SecretString> {
        if SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs()
            >= (self.last_refreshed + self.refresh_threshold)
        {
            self.refresh_jwt()?;
        }

        self.current_jwt
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("JWT not initialized"))
    }
}
