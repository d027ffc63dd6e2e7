//! `X-Hub-Signature` handling for webhook deliveries.

use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("signature header is missing")]
    Missing,
    #[error("signature header is malformed")]
    Malformed,
    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("signature doesn't match the payload")]
    Mismatch,
}

/// Checks a `sha1=<hex digest>` header against the HMAC of `body` keyed by `secret`.
///
/// The digest comparison runs in constant time.
pub fn verify_signature(secret: &[u8], header: Option<&str>, body: &[u8]) -> Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::Missing)?;

    let (algorithm, digest) = header.split_once('=').ok_or(SignatureError::Malformed)?;

    if digest.contains('=') {
        return Err(SignatureError::Malformed);
    }

    if algorithm != "sha1" {
        return Err(SignatureError::UnsupportedAlgorithm(algorithm.to_owned()));
    }

    let expected = hex::decode(digest).map_err(|_| SignatureError::Mismatch)?;

    let mut mac = new_mac(secret);
    mac.update(body);
    mac.verify_slice(&expected).map_err(|_| SignatureError::Mismatch)
}

/// Produces the header value GitHub would send for `body`.
pub fn sign_sha1(secret: &[u8], body: &[u8]) -> String {
    let mut mac = new_mac(secret);
    mac.update(body);
    format!("sha1={}", hex::encode(mac.finalize().into_bytes()))
}

fn new_mac(secret: &[u8]) -> HmacSha1 {
    // HMAC accepts keys of any length, the error branch is unreachable.
    match HmacSha1::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC-SHA1 takes keys of any size"),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const SECRET: &[u8] = b"webhook-secret";
    const BODY: &[u8] = br#"{"action":"created"}"#;

    #[test]
    fn signed_body_verifies() {
        let header = sign_sha1(SECRET, BODY);
        assert!(header.starts_with("sha1="));
        assert_eq!(verify_signature(SECRET, Some(&header), BODY), Ok(()));
    }

    #[test]
    fn known_digest() {
        // printf 'hello' | openssl dgst -sha1 -hmac key
        assert_eq!(
            sign_sha1(b"key", b"hello"),
            "sha1=b34ceac4516ff23a143e61d79d0fa7a4fbe5f266"
        );
    }

    #[rstest]
    #[case(None, SignatureError::Missing)]
    #[case(Some("sha1"), SignatureError::Malformed)]
    #[case(Some("sha1=ab=cd"), SignatureError::Malformed)]
    #[case(Some("sha256=00"), SignatureError::UnsupportedAlgorithm("sha256".to_owned()))]
    #[case(Some("sha1=not-hex"), SignatureError::Mismatch)]
    #[case(Some("sha1=0000000000000000000000000000000000000000"), SignatureError::Mismatch)]
    fn rejected_signatures(#[case] header: Option<&str>, #[case] expected: SignatureError) {
        assert_eq!(verify_signature(SECRET, header, BODY), Err(expected));
    }

    #[test]
    fn other_secret_is_rejected() {
        let header = sign_sha1(b"other", BODY);
        assert_eq!(
            verify_signature(SECRET, Some(&header), BODY),
            Err(SignatureError::Mismatch)
        );
    }
}
