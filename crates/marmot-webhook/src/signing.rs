use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// `X-Marmot-Signature: sha256=<hex(hmac_sha256(secret, body))>`, per
/// spec.md §6. `body` must already be the exact bytes that get sent — the
/// receiver recomputes this over the raw request body to verify it.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    format!("sha256={}", hex_encode(&digest))
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{b:02x}").expect("writing to a String never fails");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_for_the_same_payload_and_secret() {
        let a = sign("s3cr3t", b"{\"id\":1}");
        let b = sign("s3cr3t", b"{\"id\":1}");
        assert_eq!(a, b);
    }

    #[test]
    fn signature_changes_with_payload() {
        let a = sign("s3cr3t", b"{\"id\":1}");
        let b = sign("s3cr3t", b"{\"id\":2}");
        assert_ne!(a, b);
    }

    #[test]
    fn signature_has_sha256_prefix() {
        assert!(sign("s", b"x").starts_with("sha256="));
    }
}
