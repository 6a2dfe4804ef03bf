use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

pub const HEADER_SIGNATURE: &str = "X-Hub-Signature";
const SIGNATURE_PREFIX: &str = "sha256=";

/// Why a webhook delivery failed signature verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureRejection {
    MissingSignature,
    InvalidSignature,
}

impl SignatureRejection {
    pub fn reason(self) -> &'static str {
        match self {
            Self::MissingSignature => "missing_signature",
            Self::InvalidSignature => "invalid_signature",
        }
    }
}

/// Verifies a delivery against the shared secret.
///
/// Without a configured secret every delivery is accepted. Otherwise the
/// header must equal `sha256=` followed by the lowercase hex HMAC-SHA256 of
/// the raw body, compared in constant time over the full header string.
pub fn verify(
    body: &[u8],
    provided: Option<&str>,
    secret: Option<&str>,
) -> Result<(), SignatureRejection> {
    let Some(secret) = secret else {
        return Ok(());
    };
    let provided = provided.ok_or(SignatureRejection::MissingSignature)?;

    let expected = expected_signature(secret.as_bytes(), body)
        .ok_or(SignatureRejection::InvalidSignature)?;
    // `ct_eq` on slices of different lengths returns false without inspecting contents.
    if expected.as_bytes().ct_eq(provided.as_bytes()).into() {
        Ok(())
    } else {
        Err(SignatureRejection::InvalidSignature)
    }
}

fn expected_signature(secret: &[u8], body: &[u8]) -> Option<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).ok()?;
    mac.update(body);
    Some(format!(
        "{SIGNATURE_PREFIX}{}",
        hex::encode(mac.finalize().into_bytes())
    ))
}
