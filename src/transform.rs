//! Optional byte transform wrapped around control frames
//!
//! The cipher itself lives outside this crate. When one is installed, each
//! control line becomes `base64(encrypt(json))`; raw file payload is left
//! untouched so declared lengths stay exact.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

pub trait SecureTransform: Send + Sync {
    fn encrypt(&self, plain: &[u8]) -> Vec<u8>;
    /// `None` when the input is not authentic or cannot be decrypted
    fn decrypt(&self, sealed: &[u8]) -> Option<Vec<u8>>;
}

pub(crate) fn seal(transform: &dyn SecureTransform, json: &[u8]) -> Vec<u8> {
    STANDARD.encode(transform.encrypt(json)).into_bytes()
}

pub(crate) fn unseal(transform: &dyn SecureTransform, line: &[u8]) -> Result<Vec<u8>, String> {
    let raw = STANDARD
        .decode(line)
        .map_err(|e| format!("bad base64: {}", e))?;
    transform
        .decrypt(&raw)
        .ok_or_else(|| "decrypt failed".to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// XOR "cipher" with a one-byte tag so tampering is detectable
    pub struct XorTransform(pub u8);

    impl SecureTransform for XorTransform {
        fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
            let mut out = vec![0xA5];
            out.extend(plain.iter().map(|b| b ^ self.0));
            out
        }

        fn decrypt(&self, sealed: &[u8]) -> Option<Vec<u8>> {
            match sealed.split_first() {
                Some((0xA5, rest)) => Some(rest.iter().map(|b| b ^ self.0).collect()),
                _ => None,
            }
        }
    }

    #[test]
    fn test_seal_has_no_newlines() {
        let t = XorTransform(b'\n' ^ 0x01);
        let sealed = seal(&t, b"{\"type\":\"HEARTBEAT\"}\n\n");
        assert!(!sealed.contains(&b'\n'));
        assert_eq!(unseal(&t, &sealed).unwrap(), b"{\"type\":\"HEARTBEAT\"}\n\n");
    }

    #[test]
    fn test_unseal_rejects_garbage() {
        let t = XorTransform(7);
        assert!(unseal(&t, b"%%%").is_err());
        // valid base64, wrong tag byte
        assert!(unseal(&t, b"AAAA").is_err());
    }
}
