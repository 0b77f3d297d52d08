//! HMAC-SHA256 webhook signatures (lowercase hex over the raw body)

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::VerificationError;

type HmacSha256 = Hmac<Sha256>;

pub use hmac::digest::InvalidLength;

fn mac_for(secret: &str, body: &[u8]) -> Result<HmacSha256, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
    mac.update(body);
    Ok(mac)
}

/// Signature to put in `X-Webhook-Signature`
pub fn sign(secret: &str, body: &[u8]) -> Result<String, InvalidLength> {
    Ok(hex::encode(mac_for(secret, body)?.finalize().into_bytes()))
}

/// Check `signature` against the exact bytes received (constant-time)
pub fn verify(secret: &str, body: &[u8], signature: &str) -> Result<(), VerificationError> {
    let received = hex::decode(signature.trim()).map_err(|_| VerificationError::InvalidSignature)?;

    mac_for(secret, body)
        .map_err(|_| VerificationError::InvalidSignature)?
        .verify_slice(&received)
        .map_err(|_| VerificationError::InvalidSignature)
}
