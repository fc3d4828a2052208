//! Host-side byte transforms used by C11 to actually encrypt string literals at obfuscation
//! time. Mirrors textbook RC4 (KSA + PRGA over a 256-byte permutation) and the rotating
//! multi-byte XOR cipher described in spec §4.11; the in-module decryptor the target program
//! runs is synthesized separately as IR by `strings.rs`.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

/// Textbook RC4: key-scheduling then pseudo-random generation, XORed into `data` in place.
/// Encryption and decryption are the same operation.
pub struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    fn new(key: &[u8]) -> Self {
        assert!(!key.is_empty());
        let mut rc4 = Rc4 {
            s: [0; 256],
            i: 0,
            j: 0,
        };
        for (i, b) in rc4.s.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j.wrapping_add(rc4.s[i]).wrapping_add(key[i % key.len()]);
            rc4.s.swap(i, j as usize);
        }
        rc4
    }

    fn prga_next(&mut self) -> u8 {
        self.i = self.i.wrapping_add(1);
        self.j = self.j.wrapping_add(self.s[self.i as usize]);
        self.s.swap(self.i as usize, self.j as usize);
        self.s[(self.s[self.i as usize].wrapping_add(self.s[self.j as usize])) as usize]
    }

    pub fn apply_keystream(key: &[u8], data: &mut [u8]) {
        let mut rc4 = Rc4::new(key);
        for b in data {
            *b ^= rc4.prga_next();
        }
    }
}

/// PBKDF2-HMAC-SHA256 key derivation, password = big-endian module fingerprint (spec §4.11 step 2).
pub fn derive_rc4_key(fingerprint: u64, salt: &[u8; 8], iterations: u32, key_len: usize) -> Vec<u8> {
    let password = fingerprint.to_be_bytes();
    let mut out = vec![0u8; key_len];
    pbkdf2_hmac::<Sha256>(&password, salt, iterations, &mut out);
    out
}

/// Encrypts `data` in place with the rotating multi-byte XOR cipher: byte `i` is XORed with
/// `keys[i % keys.len()] ^ base_key ^ (i & 0xFF)` (spec §4.11).
pub fn rotating_xor_encrypt(data: &mut [u8], keys: &[u8], base_key: u8) {
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= keys[i % keys.len()] ^ base_key ^ ((i & 0xFF) as u8);
    }
}

/// Obfuscates a stored key array the same way the generated decryptor will un-obfuscate it:
/// each byte XORed with `base_key`.
pub fn obfuscate_key_bytes(keys: &[u8], base_key: u8) -> Vec<u8> {
    keys.iter().map(|k| k ^ base_key).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rc4_round_trips() {
        let key = b"a reasonably long test key";
        let plaintext = b"hello, obfuscated world!".to_vec();
        let mut buf = plaintext.clone();
        Rc4::apply_keystream(key, &mut buf);
        assert_ne!(buf, plaintext);
        Rc4::apply_keystream(key, &mut buf);
        assert_eq!(buf, plaintext);
    }

    #[test]
    fn rotating_xor_round_trips() {
        let plaintext = b"another string".to_vec();
        let mut buf = plaintext.clone();
        let keys = [0x11, 0x22, 0x33];
        rotating_xor_encrypt(&mut buf, &keys, 0x7f);
        assert_ne!(buf, plaintext);
        rotating_xor_encrypt(&mut buf, &keys, 0x7f);
        assert_eq!(buf, plaintext);
    }

    #[test]
    fn derive_rc4_key_is_deterministic() {
        let salt = [1, 2, 3, 4, 5, 6, 7, 8];
        let a = derive_rc4_key(0xdead_beef_cafe_babe, &salt, 500, 16);
        let b = derive_rc4_key(0xdead_beef_cafe_babe, &salt, 500, 16);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }
}
