//! Authorization for the streaming feed.
//!
//! The filter endpoint accepts either a static bearer token or an
//! OAuth 1.0a signed request (HMAC-SHA1 over the method, base URL and every
//! query and form parameter).

use base64::Engine;
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha1::Sha1;
use url::Url;

use ballot_common::config::{Config, FeedAuthMode};

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing credential: {0}")]
    MissingCredential(&'static str),

    #[error("Invalid signing key")]
    InvalidKey,
}

impl From<AuthError> for ballot_common::Error {
    fn from(err: AuthError) -> Self {
        Self::Auth(err.to_string())
    }
}

/// OAuth 1.0a consumer and access credentials.
#[derive(Clone)]
pub struct OAuth1Credentials {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub token: String,
    pub token_secret: String,
}

/// Produces the `Authorization` header for feed requests.
#[derive(Clone)]
pub enum Authorizer {
    Bearer(String),
    OAuth1(OAuth1Credentials),
}

impl std::fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bearer(_) => f.write_str("Authorizer::Bearer(..)"),
            Self::OAuth1(_) => f.write_str("Authorizer::OAuth1(..)"),
        }
    }
}

impl Authorizer {
    /// Build the authorizer for the configured auth mode.
    pub fn from_config(config: &Config) -> Result<Self, AuthError> {
        let secrets = &config.secrets.feed;
        let required = |value: &Option<String>, name: &'static str| {
            value
                .clone()
                .filter(|v| !v.trim().is_empty())
                .ok_or(AuthError::MissingCredential(name))
        };

        match config.feed.auth {
            FeedAuthMode::Bearer => Ok(Self::Bearer(required(
                &secrets.bearer_token,
                "secrets.feed.bearer_token",
            )?)),
            FeedAuthMode::OAuth1 => Ok(Self::OAuth1(OAuth1Credentials {
                consumer_key: required(&secrets.consumer_key, "secrets.feed.consumer_key")?,
                consumer_secret: required(&secrets.consumer_secret, "secrets.feed.consumer_secret")?,
                token: required(&secrets.access_token, "secrets.feed.access_token")?,
                token_secret: required(&secrets.access_secret, "secrets.feed.access_secret")?,
            })),
        }
    }

    /// Header value for a request with the given method, URL and form body.
    pub fn authorization_header(
        &self,
        method: &str,
        url: &Url,
        form: &[(String, String)],
    ) -> Result<String, AuthError> {
        match self {
            Self::Bearer(token) => Ok(format!("Bearer {token}")),
            Self::OAuth1(creds) => {
                let nonce: String = rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(32)
                    .map(char::from)
                    .collect();
                let timestamp = chrono::Utc::now().timestamp().to_string();
                creds.authorization_header(method, url, form, &nonce, &timestamp)
            }
        }
    }
}

impl OAuth1Credentials {
    /// Build the signed `OAuth ...` header with an explicit nonce and timestamp.
    pub fn authorization_header(
        &self,
        method: &str,
        url: &Url,
        form: &[(String, String)],
        nonce: &str,
        timestamp: &str,
    ) -> Result<String, AuthError> {
        let mut oauth_params: Vec<(String, String)> = vec![
            ("oauth_consumer_key".into(), self.consumer_key.clone()),
            ("oauth_nonce".into(), nonce.to_string()),
            ("oauth_signature_method".into(), "HMAC-SHA1".into()),
            ("oauth_timestamp".into(), timestamp.to_string()),
            ("oauth_token".into(), self.token.clone()),
            ("oauth_version".into(), "1.0".into()),
        ];

        let signature = self.signature(method, url, form, &oauth_params)?;
        oauth_params.push(("oauth_signature".into(), signature));
        oauth_params.sort();

        let fields: Vec<String> = oauth_params
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", percent_encode(k), percent_encode(v)))
            .collect();

        Ok(format!("OAuth {}", fields.join(", ")))
    }

    /// HMAC-SHA1 signature, base64 encoded.
    fn signature(
        &self,
        method: &str,
        url: &Url,
        form: &[(String, String)],
        oauth_params: &[(String, String)],
    ) -> Result<String, AuthError> {
        let mut params: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (percent_encode(&k), percent_encode(&v)))
            .chain(
                form.iter()
                    .chain(oauth_params.iter())
                    .map(|(k, v)| (percent_encode(k), percent_encode(v))),
            )
            .collect();
        params.sort();

        let param_string = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");

        let mut base_url = url.clone();
        base_url.set_query(None);
        base_url.set_fragment(None);

        let base_string = format!(
            "{}&{}&{}",
            method.to_uppercase(),
            percent_encode(base_url.as_str()),
            percent_encode(&param_string)
        );

        let key = format!(
            "{}&{}",
            percent_encode(&self.consumer_secret),
            percent_encode(&self.token_secret)
        );

        let mut mac =
            HmacSha1::new_from_slice(key.as_bytes()).map_err(|_| AuthError::InvalidKey)?;
        mac.update(base_string.as_bytes());

        Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }
}

/// RFC 3986 percent-encoding (unreserved: ALPHA / DIGIT / "-" / "." / "_" / "~").
fn percent_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
        .replace('*', "%2A")
        .replace("%7E", "~")
}
