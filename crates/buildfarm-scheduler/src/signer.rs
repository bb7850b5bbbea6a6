//! Signed URLs for restricted files.
//!
//! Workers fetch private inputs straight from the file server, so private
//! bytes never pass through the scheduler. The token is an HMAC-SHA256 of the
//! content hash under a secret shared with the file server.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct PrivateFileSigner {
    base_url: String,
    secret: Vec<u8>,
}

impl std::fmt::Debug for PrivateFileSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateFileSigner")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl PrivateFileSigner {
    pub fn new(base_url: impl Into<String>, secret: impl AsRef<[u8]>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length.
        match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC can take any size key"),
        }
    }

    /// Hex token authorising a download of `content_hash`.
    pub fn token(&self, content_hash: &str) -> String {
        let mut mac = self.mac();
        mac.update(content_hash.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// `<base>/<hash>/<filename>?token=<hex hmac>`.
    pub fn url_for(&self, content_hash: &str, filename: &str) -> String {
        format!(
            "{}/{}/{}?token={}",
            self.base_url,
            content_hash,
            filename,
            self.token(content_hash)
        )
    }

    /// Check a token presented by a worker.
    pub fn verify(&self, content_hash: &str, token: &str) -> bool {
        let Ok(expected) = hex::decode(token) else {
            return false;
        };
        let mut mac = self.mac();
        mac.update(content_hash.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }
}
