// HMAC-SHA256 signatures over short-lived string values.
//
// A token binds a value to the wall-clock second it was signed at:
// `hex(HMAC(key, ts || "_" || value)) + "_" + ts`. Verification recomputes
// the MAC from the embedded timestamp, so tokens are self-contained.
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

const SEP: &str = "_";

/// Mints and verifies signatures for string values.
///
/// ```
/// use heron_auth::Signer;
///
/// let signer = Signer::new("secret");
/// let token = signer.sign("backend");
/// assert!(signer.verify(&token, "backend"));
/// assert!(!signer.verify(&token, "frontend"));
/// ```
#[derive(Debug, Clone)]
pub struct Signer {
    key: Vec<u8>,
    // When set, tokens older than this are rejected.
    window: Option<Duration>,
}

impl Signer {
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        Self {
            key: key.as_ref().to_vec(),
            window: None,
        }
    }

    // Reject tokens whose embedded timestamp is older than `window`.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    fn mac(&self, ts: &str, value: &str) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(ts.as_bytes());
        mac.update(SEP.as_bytes());
        mac.update(value.as_bytes());
        mac
    }

    /// Returns a signature token for `value`.
    pub fn sign(&self, value: &str) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let ts = format!("{now:.6}");
        let digest = self.mac(&ts, value).finalize().into_bytes();
        format!("{}{SEP}{ts}", hex::encode(digest))
    }

    /// Checks that `token` signs `value`, and that it is fresh enough when a
    /// window is configured. All failure modes return `false`.
    pub fn verify(&self, token: &str, value: &str) -> bool {
        let Some((mac_hex, ts)) = token.split_once(SEP) else {
            return false;
        };
        let Ok(digest) = hex::decode(mac_hex) else {
            return false;
        };
        // Constant-time comparison; a recomputed MAC over the embedded
        // timestamp must match byte for byte.
        if self.mac(ts, value).verify_slice(&digest).is_err() {
            return false;
        }
        let Some(window) = self.window else {
            return true;
        };
        let Ok(signed_at) = ts.parse::<f64>() else {
            return false;
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        now - signed_at <= window.as_secs_f64()
    }
}
