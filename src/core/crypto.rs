//! Cryptographic primitives for the standard security handler.
//!
//! - MD5, SHA-256, SHA-384 and SHA-512 hashing
//! - ARC4 (RC4) stream cipher
//! - AES-128 and AES-256 in CBC mode
//! - PDF 1.7 (R5) and PDF 2.0 (R6) password algorithms
//!
//! Based on PDF.js src/core/crypto.js. Hashes and block ciphers come from
//! the RustCrypto crates; RC4 is small enough to live here.

use super::error::{PDFError, PDFResult};
use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};
use sha2::{Sha256, Sha384, Sha512};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Calculates the MD5 hash of the input data.
pub fn calculate_md5(data: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&Md5::digest(data));
    out
}

/// Calculates the SHA-256 hash of the input data.
pub fn calculate_sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// Calculates the SHA-384 hash of the input data.
pub fn calculate_sha384(data: &[u8]) -> [u8; 48] {
    let mut out = [0u8; 48];
    out.copy_from_slice(&Sha384::digest(data));
    out
}

/// Calculates the SHA-512 hash of the input data.
pub fn calculate_sha512(data: &[u8]) -> [u8; 64] {
    let mut out = [0u8; 64];
    out.copy_from_slice(&Sha512::digest(data));
    out
}

/// ARC4 (alleged RC4) stream cipher.
pub struct ARC4Cipher {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl ARC4Cipher {
    /// Creates a new ARC4 cipher with the given key.
    pub fn new(key: &[u8]) -> Self {
        let mut s = [0u8; 256];
        for (i, slot) in s.iter_mut().enumerate() {
            *slot = i as u8;
        }

        if !key.is_empty() {
            let mut j: u8 = 0;
            for i in 0..256 {
                j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
                s.swap(i, j as usize);
            }
        }

        ARC4Cipher { s, i: 0, j: 0 }
    }

    /// Encrypts or decrypts the input data (ARC4 is symmetric).
    pub fn encrypt_block(&mut self, input: &[u8]) -> Vec<u8> {
        input
            .iter()
            .map(|&byte| {
                self.i = self.i.wrapping_add(1);
                self.j = self.j.wrapping_add(self.s[self.i as usize]);
                self.s.swap(self.i as usize, self.j as usize);
                let k = self.s[self.s[self.i as usize].wrapping_add(self.s[self.j as usize]) as usize];
                byte ^ k
            })
            .collect()
    }
}

/// Strips PKCS#7 padding, leaving the data untouched when the padding is invalid.
fn strip_padding(mut data: Vec<u8>) -> Vec<u8> {
    let Some(&pad_len) = data.last() else {
        return data;
    };
    let pad = pad_len as usize;
    if (1..=16).contains(&pad) && pad <= data.len() && data[data.len() - pad..].iter().all(|&b| b == pad_len) {
        data.truncate(data.len() - pad);
    } else {
        log::warn!("AES: invalid PKCS#7 padding byte {}, keeping data", pad_len);
    }
    data
}

/// Trims input to whole 16-byte blocks.
fn whole_blocks(input: &[u8]) -> &[u8] {
    let usable = input.len() - input.len() % 16;
    if usable != input.len() {
        log::warn!("AES: dropping {} trailing bytes of a partial block", input.len() - usable);
    }
    &input[..usable]
}

/// AES-128 in CBC mode.
pub struct AES128Cipher {
    key: [u8; 16],
}

impl AES128Cipher {
    pub fn new(key: &[u8; 16]) -> Self {
        AES128Cipher { key: *key }
    }

    /// Encrypts whole blocks without padding; a trailing partial block is dropped.
    pub fn encrypt_no_padding(&self, input: &[u8], iv: &[u8; 16]) -> Vec<u8> {
        let mut buf = whole_blocks(input).to_vec();
        let len = buf.len();
        match Aes128CbcEnc::new_from_slices(&self.key, iv) {
            Ok(encryptor) => encryptor
                .encrypt_padded_mut::<NoPadding>(&mut buf, len)
                .map(<[u8]>::to_vec)
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    /// Decrypts a payload whose first 16 bytes are the IV, removing PKCS#7 padding.
    pub fn decrypt(&self, input: &[u8]) -> PDFResult<Vec<u8>> {
        if input.len() < 16 {
            return Err(PDFError::Decode(format!("AES data too short: {} bytes", input.len())));
        }
        let (iv, body) = input.split_at(16);
        let mut buf = whole_blocks(body).to_vec();
        let plain = Aes128CbcDec::new_from_slices(&self.key, iv)
            .map_err(|e| PDFError::Decode(format!("AES-128 init: {}", e)))?
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|e| PDFError::Decode(format!("AES-128 decrypt: {}", e)))?
            .to_vec();
        Ok(strip_padding(plain))
    }
}

/// AES-256 in CBC mode.
pub struct AES256Cipher {
    key: [u8; 32],
}

impl AES256Cipher {
    pub fn new(key: &[u8; 32]) -> Self {
        AES256Cipher { key: *key }
    }

    /// Decrypts a payload whose first 16 bytes are the IV, removing PKCS#7 padding.
    pub fn decrypt(&self, input: &[u8]) -> PDFResult<Vec<u8>> {
        if input.len() < 16 {
            return Err(PDFError::Decode(format!("AES data too short: {} bytes", input.len())));
        }
        let (iv, body) = input.split_at(16);
        let iv: [u8; 16] = iv
            .try_into()
            .map_err(|_| PDFError::Decode("AES IV must be 16 bytes".to_string()))?;
        Ok(strip_padding(self.decrypt_block(body, &iv)?))
    }

    /// Decrypts whole blocks with an explicit IV and no padding removal.
    pub fn decrypt_block(&self, input: &[u8], iv: &[u8; 16]) -> PDFResult<Vec<u8>> {
        let mut buf = whole_blocks(input).to_vec();
        Ok(Aes256CbcDec::new_from_slices(&self.key, iv)
            .map_err(|e| PDFError::Decode(format!("AES-256 init: {}", e)))?
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|e| PDFError::Decode(format!("AES-256 decrypt: {}", e)))?
            .to_vec())
    }
}

/// Password checks and key unwrapping for the AES-256 handlers (R5 and R6).
pub trait PDFPasswordAlgorithm {
    /// Hashes `password ‖ salt ‖ user_bytes`.
    fn hash(&self, password: &[u8], salt: &[u8], user_bytes: &[u8]) -> [u8; 32];

    /// Checks a user password against the first 32 bytes of /U.
    fn check_user_password(&self, password: &[u8], user_validation_salt: &[u8], user_password: &[u8]) -> bool {
        self.hash(password, user_validation_salt, &[])[..] == *user_password
    }

    /// Checks an owner password against the first 32 bytes of /O.
    fn check_owner_password(
        &self,
        password: &[u8],
        owner_validation_salt: &[u8],
        user_bytes: &[u8],
        owner_password: &[u8],
    ) -> bool {
        self.hash(password, owner_validation_salt, user_bytes)[..] == *owner_password
    }

    /// Unwraps the file key from /UE with the user password.
    fn get_user_key(&self, password: &[u8], user_key_salt: &[u8], user_encryption: &[u8]) -> PDFResult<Vec<u8>> {
        let key = self.hash(password, user_key_salt, &[]);
        AES256Cipher::new(&key).decrypt_block(user_encryption, &[0u8; 16])
    }

    /// Unwraps the file key from /OE with the owner password.
    fn get_owner_key(
        &self,
        password: &[u8],
        owner_key_salt: &[u8],
        user_bytes: &[u8],
        owner_encryption: &[u8],
    ) -> PDFResult<Vec<u8>> {
        let key = self.hash(password, owner_key_salt, user_bytes);
        AES256Cipher::new(&key).decrypt_block(owner_encryption, &[0u8; 16])
    }
}

fn concat(parts: &[&[u8]]) -> Vec<u8> {
    parts.concat()
}

/// PDF 1.7 Adobe extension level 3 (R5): a single SHA-256.
#[derive(Debug, Default, Clone, Copy)]
pub struct PDF17;

impl PDFPasswordAlgorithm for PDF17 {
    fn hash(&self, password: &[u8], salt: &[u8], user_bytes: &[u8]) -> [u8; 32] {
        calculate_sha256(&concat(&[password, salt, user_bytes]))
    }
}

/// PDF 2.0 (R6): ISO 32000-2 Algorithm 2.B.
#[derive(Debug, Default, Clone, Copy)]
pub struct PDF20;

impl PDFPasswordAlgorithm for PDF20 {
    fn hash(&self, password: &[u8], salt: &[u8], user_bytes: &[u8]) -> [u8; 32] {
        let mut k: Vec<u8> = calculate_sha256(&concat(&[password, salt, user_bytes])).to_vec();
        let mut e: Vec<u8> = vec![0];
        let mut i: u32 = 0;

        while i < 64 || u32::from(e.last().copied().unwrap_or(0)) > i.saturating_sub(32) {
            let block = concat(&[password, &k, user_bytes]);
            let k1 = block.repeat(64);

            let mut key = [0u8; 16];
            let mut iv = [0u8; 16];
            key.copy_from_slice(&k[..16]);
            iv.copy_from_slice(&k[16..32]);
            e = AES128Cipher::new(&key).encrypt_no_padding(&k1, &iv);

            // 256 % 3 == 1, so the big-endian value mod 3 is the byte sum mod 3
            let remainder = e[..16].iter().map(|&b| b as u32).sum::<u32>() % 3;
            k = match remainder {
                0 => calculate_sha256(&e).to_vec(),
                1 => calculate_sha384(&e).to_vec(),
                _ => calculate_sha512(&e).to_vec(),
            };
            i += 1;
        }

        let mut out = [0u8; 32];
        out.copy_from_slice(&k[..32]);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    #[test]
    fn test_md5_rfc1321() {
        assert_eq!(calculate_md5(b"").to_vec(), h("d41d8cd98f00b204e9800998ecf8427e"));
        assert_eq!(calculate_md5(b"abc").to_vec(), h("900150983cd24fb0d6963f7d28e17f72"));
        assert_eq!(
            calculate_md5(b"message digest").to_vec(),
            h("f96b697d7cb7938d525a2f31aaf161d0")
        );
    }

    #[test]
    fn test_sha_family_lengths() {
        assert_eq!(
            calculate_sha256(b"abc").to_vec(),
            h("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        assert_eq!(calculate_sha384(b"abc").len(), 48);
        assert_eq!(calculate_sha512(b"abc").len(), 64);
    }

    #[test]
    fn test_arc4_vectors() {
        let mut cipher = ARC4Cipher::new(&h("0123456789abcdef"));
        assert_eq!(cipher.encrypt_block(&h("0123456789abcdef")), h("75b7878099e0c596"));

        let mut cipher = ARC4Cipher::new(&h("0123456789abcdef"));
        assert_eq!(cipher.encrypt_block(&h("0000000000000000")), h("7494c2e7104b0879"));
    }

    #[test]
    fn test_aes128_fips_vector() {
        let key: [u8; 16] = h("000102030405060708090a0b0c0d0e0f").try_into().unwrap();
        let cipher = AES128Cipher::new(&key);
        let encrypted = cipher.encrypt_no_padding(&h("00112233445566778899aabbccddeeff"), &[0u8; 16]);
        assert_eq!(encrypted, h("69c4e0d86a7b0430d8cdb78070b4c55a"));
    }

    #[test]
    fn test_aes128_decrypt_strips_padding() {
        let key = [7u8; 16];
        let iv = [3u8; 16];
        let cipher = AES128Cipher::new(&key);
        let mut plain = b"hello".to_vec();
        plain.extend(std::iter::repeat_n(11u8, 11));
        let mut payload = iv.to_vec();
        payload.extend(cipher.encrypt_no_padding(&plain, &iv));
        assert_eq!(cipher.decrypt(&payload).unwrap(), b"hello");
    }

    #[test]
    fn test_aes256_decrypt_block() {
        let key: [u8; 32] = h("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f")
            .try_into()
            .unwrap();
        let cipher = AES256Cipher::new(&key);
        let result = cipher
            .decrypt_block(&h("8ea2b7ca516745bfeafc49904b496089"), &[0u8; 16])
            .unwrap();
        assert_eq!(result, h("00112233445566778899aabbccddeeff"));
    }

    #[test]
    fn test_pdf17_user_password_and_key() {
        let alg = PDF17;
        let password = b"user";
        let user_validation = [117, 169, 4, 32, 159, 101, 22, 220];
        let user_password = [
            131, 242, 143, 160, 87, 2, 138, 134, 79, 253, 189, 173, 224, 73, 144, 241, 190, 81,
            197, 15, 249, 105, 145, 151, 15, 194, 65, 3, 1, 126, 187, 221,
        ];
        assert!(alg.check_user_password(password, &user_validation, &user_password));
        assert!(!alg.check_user_password(b"wrong", &user_validation, &user_password));

        let user_key_salt = [168, 94, 215, 192, 100, 38, 188, 40];
        let user_encryption = [
            35, 150, 195, 169, 245, 51, 51, 255, 158, 158, 33, 242, 231, 75, 125, 190, 25, 126,
            172, 114, 195, 244, 137, 245, 234, 165, 42, 74, 60, 38, 17, 17,
        ];
        let expected = vec![
            63, 114, 136, 209, 87, 61, 12, 30, 249, 1, 186, 144, 254, 248, 163, 153, 151, 51,
            133, 10, 80, 152, 206, 15, 72, 187, 231, 33, 224, 239, 13, 213,
        ];
        assert_eq!(alg.get_user_key(password, &user_key_salt, &user_encryption).unwrap(), expected);
    }

    #[test]
    fn test_pdf20_user_password() {
        let alg = PDF20;
        let user_validation = [83, 245, 146, 101, 198, 247, 34, 198];
        let user_password = [
            94, 230, 205, 75, 166, 99, 250, 76, 219, 128, 17, 85, 57, 17, 33, 164, 150, 46, 103,
            176, 160, 156, 187, 233, 166, 223, 163, 253, 147, 235, 95, 184,
        ];
        assert!(alg.check_user_password(b"user", &user_validation, &user_password));
    }

    #[test]
    fn test_pdf20_owner_key() {
        let alg = PDF20;
        let owner_key_salt = [29, 208, 185, 46, 11, 76, 135, 149];
        let owner_encryption = [
            209, 73, 224, 77, 103, 155, 201, 181, 190, 68, 223, 20, 62, 90, 56, 210, 5, 240, 178,
            128, 238, 124, 68, 254, 253, 244, 62, 108, 208, 135, 10, 251,
        ];
        let u_bytes = [
            94, 230, 205, 75, 166, 99, 250, 76, 219, 128, 17, 85, 57, 17, 33, 164, 150, 46, 103,
            176, 160, 156, 187, 233, 166, 223, 163, 253, 147, 235, 95, 184, 83, 245, 146, 101,
            198, 247, 34, 198, 191, 11, 16, 94, 237, 216, 20, 175,
        ];
        let expected = vec![
            42, 218, 213, 39, 73, 91, 72, 79, 67, 38, 248, 133, 18, 189, 61, 34, 107, 79, 29, 56,
            59, 181, 213, 118, 113, 34, 65, 210, 87, 174, 22, 239,
        ];
        assert_eq!(
            alg.get_owner_key(b"owner", &owner_key_salt, &u_bytes, &owner_encryption).unwrap(),
            expected
        );
    }
}
