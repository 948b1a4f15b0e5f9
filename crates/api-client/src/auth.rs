use crate::error::ApiError;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signs a query string with HMAC-SHA256 and returns the hex digest Binance
/// expects in the `signature` parameter.
pub fn sign_request(secret: &str, query_string: &str) -> Result<String, ApiError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ApiError::InvalidData(format!("unusable API secret: {}", e)))?;
    mac.update(query_string.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}
