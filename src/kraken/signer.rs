// =============================================================================
// Kraken Request Signer — HMAC-SHA512 over path + SHA256(nonce + body)
// =============================================================================
//
// SECURITY: the decoded secret never leaves this struct and is redacted from
// `Debug`. Only `masked_api_key()` is safe to log.
//
// Kraken rejects any private call whose nonce is not greater than the last one
// it saw for the key, so nonces come from a single process-wide counter that
// never moves backwards, even if the wall clock does.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use tracing::debug;

use crate::error::{FeedError, FeedResult};

type HmacSha512 = Hmac<Sha512>;

/// Ordered form parameters. Order matters: it is the order they are encoded
/// (and therefore signed) in.
pub type Params = Vec<(String, String)>;

/// Header carrying the public API key.
pub const API_KEY_HEADER: &str = "API-Key";
/// Header carrying the request signature.
pub const API_SIGN_HEADER: &str = "API-Sign";

static PROCESS_NONCE: NonceGenerator = NonceGenerator::new();

// -----------------------------------------------------------------------------
// Nonce generation
// -----------------------------------------------------------------------------

/// Strictly increasing nonce source: `max(previous + 1, now_µs)`.
#[derive(Debug)]
pub struct NonceGenerator {
    last: AtomicU64,
}

impl NonceGenerator {
    pub const fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Next nonce based on the current wall clock in microseconds.
    pub fn next(&self) -> u64 {
        self.next_at(now_micros())
    }

    /// Next nonce given an explicit clock reading. Lock-free CAS loop, so
    /// concurrent callers always get distinct, increasing values.
    pub fn next_at(&self, now_micros: u64) -> u64 {
        let mut prev = self.last.load(Ordering::Acquire);
        loop {
            let candidate = now_micros.max(prev.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }

    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }
}

impl Default for NonceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

// -----------------------------------------------------------------------------
// Signer
// -----------------------------------------------------------------------------

/// Header values produced for one private request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub api_key: String,
    pub api_sign: String,
}

impl SignedHeaders {
    /// `(name, value)` pairs ready to attach to an HTTP request.
    pub fn pairs(&self) -> [(&'static str, String); 2] {
        [
            (API_KEY_HEADER, self.api_key.clone()),
            (API_SIGN_HEADER, self.api_sign.clone()),
        ]
    }
}

/// Signs Kraken private REST requests.
pub struct RequestSigner {
    api_key: String,
    secret: Vec<u8>,
    nonces: &'static NonceGenerator,
}

impl RequestSigner {
    /// Create a signer from the public key and the Base64-encoded secret.
    ///
    /// Fails with `InvalidSecretFormat` if the secret does not decode and with
    /// `Auth` if either credential is empty.
    pub fn new(api_key: impl Into<String>, api_secret_b64: impl AsRef<str>) -> FeedResult<Self> {
        let api_key = api_key.into();
        let api_secret_b64 = api_secret_b64.as_ref().trim();
        if api_key.is_empty() || api_secret_b64.is_empty() {
            return Err(FeedError::Auth("API key and secret cannot be empty".into()));
        }

        let secret = BASE64
            .decode(api_secret_b64)
            .map_err(|e| FeedError::InvalidSecretFormat(e.to_string()))?;

        Ok(Self {
            api_key,
            secret,
            nonces: &PROCESS_NONCE,
        })
    }

    /// Insert a fresh nonce into `params` and sign the request.
    ///
    /// An existing `nonce` entry keeps its position and gets the new value.
    pub fn sign(&self, path: &str, params: &mut Params) -> FeedResult<SignedHeaders> {
        if path.is_empty() {
            return Err(FeedError::EmptyPath);
        }

        let nonce = self.nonces.next().to_string();
        match params.iter_mut().find(|(k, _)| k == "nonce") {
            Some((_, v)) => *v = nonce.clone(),
            None => params.push(("nonce".to_string(), nonce.clone())),
        }

        let api_sign = self.signature(path, params)?;
        debug!(path, nonce = %nonce, key = %self.masked_api_key(), "signed private request");

        Ok(SignedHeaders {
            api_key: self.api_key.clone(),
            api_sign,
        })
    }

    /// Compute `API-Sign` for params that already carry their nonce.
    /// Deterministic for a fixed path, params and secret.
    pub fn signature(&self, path: &str, params: &Params) -> FeedResult<String> {
        if path.is_empty() {
            return Err(FeedError::EmptyPath);
        }
        let nonce = params
            .iter()
            .find(|(k, _)| k == "nonce")
            .map(|(_, v)| v.as_str())
            .ok_or_else(|| FeedError::InvalidParameter("params carry no nonce".into()))?;

        let body = encode_form(params);

        let mut sha256 = Sha256::new();
        sha256.update(nonce.as_bytes());
        sha256.update(body.as_bytes());
        let digest = sha256.finalize();

        let mut mac = HmacSha512::new_from_slice(&self.secret)
            .map_err(|e| FeedError::InvalidSecretFormat(e.to_string()))?;
        mac.update(path.as_bytes());
        mac.update(&digest);

        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// API key with the middle replaced, for logs.
    pub fn masked_api_key(&self) -> String {
        let chars: Vec<char> = self.api_key.chars().collect();
        if chars.len() <= 8 {
            return "***".to_string();
        }
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}***{tail}")
    }
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("api_key", &self.masked_api_key())
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// `application/x-www-form-urlencoded` encoding of ordered params.
pub fn encode_form(params: &[(String, String)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .finish()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    // Kraken's published AddOrder example.
    const DOC_SECRET: &str =
        "kQH5HW/8p1uGOVjbgWA7FunAmGO8lsSUXNsu3eow76sz84Q18fWxnyRzBHCd3pd5nE9qa99HAZtuZuj6F1huXg==";
    const DOC_SIGNATURE: &str =
        "4/dpxb3iT4tp/ZCVEwSnEsLxx0bqyhLpdfOpc6fn7OR8+UClSV5n9E6aSS8MPtnRfp32bAb0nmbRn6H8ndwLUQ==";

    // Base64 of "test_secret_key_12345".
    const TEST_SECRET: &str = "dGVzdF9zZWNyZXRfa2V5XzEyMzQ1";

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn reproduces_kraken_documentation_vector() {
        let signer = RequestSigner::new("doc-key", DOC_SECRET).unwrap();
        let p = params(&[
            ("nonce", "1616492376594"),
            ("ordertype", "limit"),
            ("pair", "XBTUSD"),
            ("price", "37500"),
            ("type", "buy"),
            ("volume", "1.25"),
        ]);
        assert_eq!(signer.signature("/0/private/AddOrder", &p).unwrap(), DOC_SIGNATURE);
    }

    #[test]
    fn reproduces_balance_vector() {
        let signer = RequestSigner::new("test-key", TEST_SECRET).unwrap();
        let p = params(&[("nonce", "42")]);
        assert_eq!(
            signer.signature("/0/private/Balance", &p).unwrap(),
            "Bw5lv+ASu9FfrRNyusrWa4dDSZxONUqcANmiz5B47GiSx1Czx6yf85ucZhY5U8jsZJUflvcP5uuSiOVJ7+U4CA=="
        );
    }

    #[test]
    fn signature_is_deterministic_and_path_sensitive() {
        let signer = RequestSigner::new("test-key", TEST_SECRET).unwrap();
        let p = params(&[("nonce", "1"), ("asset", "XBT")]);
        let a = signer.signature("/0/private/Balance", &p).unwrap();
        let b = signer.signature("/0/private/Balance", &p).unwrap();
        let c = signer.signature("/0/private/OpenOrders", &p).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(BASE64.decode(&a).unwrap().len(), 64);
    }

    #[test]
    fn invalid_secret_is_rejected_at_construction() {
        assert!(matches!(
            RequestSigner::new("key", "not-valid-base64!!!"),
            Err(FeedError::InvalidSecretFormat(_))
        ));
        assert!(matches!(RequestSigner::new("", TEST_SECRET), Err(FeedError::Auth(_))));
    }

    #[test]
    fn empty_path_is_rejected() {
        let signer = RequestSigner::new("test-key", TEST_SECRET).unwrap();
        let mut p = Params::new();
        assert_eq!(signer.sign("", &mut p), Err(FeedError::EmptyPath));
        assert!(p.is_empty());
    }

    #[test]
    fn sign_inserts_or_replaces_nonce() {
        let signer = RequestSigner::new("test-key", TEST_SECRET).unwrap();

        let mut p = params(&[("asset", "XBT")]);
        let headers = signer.sign("/0/private/Balance", &mut p).unwrap();
        assert_eq!(p.len(), 2);
        assert_eq!(p[1].0, "nonce");
        assert_eq!(headers.api_key, "test-key");
        assert_eq!(headers.api_sign, signer.signature("/0/private/Balance", &p).unwrap());

        let mut p = params(&[("nonce", "0"), ("asset", "XBT")]);
        signer.sign("/0/private/Balance", &mut p).unwrap();
        assert_eq!(p[0].0, "nonce");
        assert_ne!(p[0].1, "0");
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn back_to_back_nonces_strictly_increase() {
        let signer = RequestSigner::new("test-key", TEST_SECRET).unwrap();
        let mut last = 0u64;
        for _ in 0..1_000 {
            let mut p = Params::new();
            signer.sign("/0/private/Balance", &mut p).unwrap();
            let n: u64 = p[0].1.parse().unwrap();
            assert!(n > last);
            last = n;
        }
    }

    #[test]
    fn nonce_survives_clock_going_backwards() {
        let gen = NonceGenerator::new();
        assert_eq!(gen.next_at(1_000), 1_000);
        assert_eq!(gen.next_at(1_000), 1_001);
        assert_eq!(gen.next_at(500), 1_002);
        assert_eq!(gen.next_at(5_000), 5_000);
    }

    #[test]
    fn concurrent_nonces_are_unique() {
        let gen = Arc::new(NonceGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gen = Arc::clone(&gen);
                std::thread::spawn(move || (0..500).map(|_| gen.next_at(7)).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total);
    }

    #[test]
    fn debug_redacts_secret() {
        let signer = RequestSigner::new("ABCDEFGHIJKL", TEST_SECRET).unwrap();
        let dbg = format!("{signer:?}");
        assert!(dbg.contains("ABCD***IJKL"));
        assert!(!dbg.contains(TEST_SECRET));
    }

    #[test]
    fn masking_handles_multibyte_keys() {
        let signer = RequestSigner::new("ñøkéÿ-middle-ßéçrét", TEST_SECRET).unwrap();
        assert_eq!(signer.masked_api_key(), "ñøké***çrét");

        let short = RequestSigner::new("ééééééé", TEST_SECRET).unwrap();
        assert_eq!(short.masked_api_key(), "***");
    }
}
