use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{json, Value};

use super::EnrollmentError;

/// Creation options with the binary fields decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct CreationOptions {
    pub challenge: Vec<u8>,
    pub user_id: Vec<u8>,
    pub exclude_credentials: Vec<Vec<u8>>,
    /// The options exactly as the server sent them.
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredCredential {
    pub id: String,
    pub kind: String,
    pub raw_id: Vec<u8>,
    pub attestation_object: Vec<u8>,
    pub client_data_json: Vec<u8>,
    pub client_extension_results: Value,
}

pub trait CredentialCodec: Send + Sync {
    fn decode_creation_options(&self, options: &Value) -> Result<CreationOptions, EnrollmentError>;

    fn encode_credential(&self, credential: &RegisteredCredential) -> Result<Value, EnrollmentError>;
}

/// Unpadded base64url, as the registration endpoints speak it. Decoding also
/// tolerates padding and the standard alphabet.
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64UrlCodec;

impl Base64UrlCodec {
    pub fn encode(bytes: &[u8]) -> String {
        URL_SAFE_NO_PAD.encode(bytes)
    }

    pub fn decode(text: &str) -> Result<Vec<u8>, EnrollmentError> {
        let normalized: String = text
            .trim_end_matches('=')
            .chars()
            .map(|c| match c {
                '+' => '-',
                '/' => '_',
                other => other,
            })
            .collect();
        URL_SAFE_NO_PAD
            .decode(normalized)
            .map_err(|err| EnrollmentError::Codec(format!("invalid base64url: {err}")))
    }

    fn decode_field(value: Option<&Value>, field: &str) -> Result<Vec<u8>, EnrollmentError> {
        let text = value
            .and_then(Value::as_str)
            .ok_or_else(|| EnrollmentError::Codec(format!("missing {field}")))?;
        Self::decode(text)
    }
}

impl CredentialCodec for Base64UrlCodec {
    fn decode_creation_options(&self, options: &Value) -> Result<CreationOptions, EnrollmentError> {
        let challenge = Self::decode_field(options.get("challenge"), "challenge")?;
        let user_id = Self::decode_field(options.pointer("/user/id"), "user.id")?;
        let exclude_credentials = match options.get("excludeCredentials") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(entries)) => entries
                .iter()
                .map(|entry| Self::decode_field(entry.get("id"), "excludeCredentials[].id"))
                .collect::<Result<_, _>>()?,
            Some(_) => {
                return Err(EnrollmentError::Codec(
                    "excludeCredentials must be an array".into(),
                ))
            }
        };
        Ok(CreationOptions {
            challenge,
            user_id,
            exclude_credentials,
            raw: options.clone(),
        })
    }

    fn encode_credential(&self, credential: &RegisteredCredential) -> Result<Value, EnrollmentError> {
        Ok(json!({
            "id": credential.id,
            "type": credential.kind,
            "rawId": Self::encode(&credential.raw_id),
            "response": {
                "attestationObject": Self::encode(&credential.attestation_object),
                "clientDataJSON": Self::encode(&credential.client_data_json),
            },
            "clientExtensionResults": credential.client_extension_results,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_binary_fields_from_server_options() {
        let options = json!({
            "challenge": "AAEC_w",
            "rp": {"name": "Example"},
            "user": {"id": "dXNlci0x", "name": "user@example.com"},
            "excludeCredentials": [{"id": "AQI=", "type": "public-key"}]
        });
        let decoded = Base64UrlCodec.decode_creation_options(&options).unwrap();
        assert_eq!(decoded.challenge, vec![0, 1, 2, 255]);
        assert_eq!(decoded.user_id, b"user-1".to_vec());
        assert_eq!(decoded.exclude_credentials, vec![vec![1, 2]]);
        assert_eq!(decoded.raw["rp"]["name"], "Example");
    }

    #[test]
    fn missing_challenge_is_a_codec_error() {
        let err = Base64UrlCodec
            .decode_creation_options(&json!({"user": {"id": "AA"}}))
            .unwrap_err();
        assert!(matches!(err, EnrollmentError::Codec(message) if message.contains("challenge")));
    }

    #[test]
    fn encodes_credential_without_padding() {
        let credential = RegisteredCredential {
            id: "cred-1".into(),
            kind: "public-key".into(),
            raw_id: vec![0xfb, 0xff],
            attestation_object: vec![1],
            client_data_json: br#"{"type":"webauthn.create"}"#.to_vec(),
            client_extension_results: json!({}),
        };
        let encoded = Base64UrlCodec.encode_credential(&credential).unwrap();
        assert_eq!(encoded["rawId"], "-_8");
        assert_eq!(encoded["response"]["attestationObject"], "AQ");
        assert_eq!(encoded["type"], "public-key");
        assert_eq!(
            Base64UrlCodec::decode(encoded["response"]["clientDataJSON"].as_str().unwrap()).unwrap(),
            credential.client_data_json
        );
    }
}
