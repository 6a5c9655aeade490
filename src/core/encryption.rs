//! Standard security handler.
//!
//! Validates the password against the /Encrypt dictionary, derives the file
//! key and builds per-object ciphers for strings and streams.
//!
//! Supports V 1, 2, 4 and 5 with revisions 2 to 6: RC4 (40 to 128 bit),
//! AESV2 (AES-128) and AESV3 (AES-256).
//!
//! Based on PDF.js src/core/crypto.js (CipherTransformFactory)

use super::crypto::{calculate_md5, AES128Cipher, AES256Cipher, ARC4Cipher, PDFPasswordAlgorithm, PDF17, PDF20};
use super::error::{PDFError, PDFResult};
use super::parser::{Dict, PDFObject};

/// Padding appended to passwords for the RC4 based revisions.
const DEFAULT_PASSWORD_PAD: [u8; 32] = [
    0x28, 0xbf, 0x4e, 0x5e, 0x4e, 0x75, 0x8a, 0x41, 0x64, 0x00, 0x4e, 0x56, 0xff, 0xfa, 0x01, 0x08,
    0x2e, 0x2e, 0x00, 0xb6, 0xd0, 0x68, 0x3e, 0x80, 0x2f, 0x0c, 0xa9, 0xfe, 0x64, 0x53, 0x69, 0x7a,
];

/// Passwords for the AES-256 revisions are truncated to this many bytes.
const MAX_AES256_PASSWORD: usize = 127;

/// Permission flags from the /P entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PDFPermissions {
    pub print: bool,
    pub modify: bool,
    pub copy: bool,
    pub annotate: bool,
    pub fill_form: bool,
    pub extract: bool,
    pub assemble: bool,
    pub print_high_quality: bool,
    /// Raw /P value
    pub raw_value: i32,
}

impl PDFPermissions {
    pub fn from_p_value(p: i32) -> Self {
        let bits = p as u32;
        PDFPermissions {
            print: bits & 0x0004 != 0,
            modify: bits & 0x0008 != 0,
            copy: bits & 0x0010 != 0,
            annotate: bits & 0x0020 != 0,
            fill_form: bits & 0x0100 != 0,
            extract: bits & 0x0200 != 0,
            assemble: bits & 0x0400 != 0,
            print_high_quality: bits & 0x0800 != 0,
            raw_value: p,
        }
    }
}

/// Cipher selected by a crypt filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptMethod {
    /// Data is stored in the clear
    Identity,
    /// RC4 with a per-object key
    RC4,
    /// AES-128 with a per-object key
    AESV2,
    /// AES-256 with the file key
    AESV3,
}

/// Pads or truncates a password to 32 bytes.
fn pad_password(password: &[u8]) -> [u8; 32] {
    let mut padded = DEFAULT_PASSWORD_PAD;
    let len = password.len().min(32);
    padded[..len].copy_from_slice(&password[..len]);
    padded[len..].copy_from_slice(&DEFAULT_PASSWORD_PAD[..32 - len]);
    padded
}

/// RC4 applied 20 times with the key XORed by 0..=19 (or 19..=0 when decoding).
fn rc4_rounds(key: &[u8], data: &[u8], descending: bool) -> Vec<u8> {
    let mut output = data.to_vec();
    let mut rounds: Vec<u8> = (0..20).collect();
    if descending {
        rounds.reverse();
    }
    for round in rounds {
        let derived: Vec<u8> = key.iter().map(|b| b ^ round).collect();
        output = ARC4Cipher::new(&derived).encrypt_block(&output);
    }
    output
}

/// Parameters of an RC4/AES-128 file key computation.
struct KeyParams<'a> {
    file_id: &'a [u8],
    owner_password: &'a [u8],
    user_password: &'a [u8],
    flags: i32,
    revision: u32,
    key_length: usize,
    encrypt_metadata: bool,
}

impl KeyParams<'_> {
    /// Computes the file key for `password` (Algorithm 2).
    fn file_key(&self, password: &[u8]) -> Vec<u8> {
        let mut hash_data = Vec::with_capacity(32 + self.owner_password.len() + 4 + self.file_id.len() + 4);
        hash_data.extend_from_slice(&pad_password(password));
        hash_data.extend_from_slice(self.owner_password);
        hash_data.extend_from_slice(&self.flags.to_le_bytes());
        hash_data.extend_from_slice(self.file_id);
        if self.revision >= 4 && !self.encrypt_metadata {
            hash_data.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        }

        let n = self.key_length;
        let mut hash = calculate_md5(&hash_data);
        if self.revision >= 3 {
            for _ in 0..50 {
                hash = calculate_md5(&hash[..n]);
            }
        }
        hash[..n].to_vec()
    }

    /// Returns the file key when `password` is the user password (Algorithms 4 and 5).
    fn check_user_password(&self, password: &[u8]) -> Option<Vec<u8>> {
        let key = self.file_key(password);
        let valid = if self.revision >= 3 {
            let mut seed = DEFAULT_PASSWORD_PAD.to_vec();
            seed.extend_from_slice(self.file_id);
            let check = rc4_rounds(&key, &calculate_md5(&seed), false);
            self.user_password.len() >= 16 && check[..16] == self.user_password[..16]
        } else {
            let check = ARC4Cipher::new(&key).encrypt_block(&DEFAULT_PASSWORD_PAD);
            self.user_password.len() >= 32 && check[..] == self.user_password[..32]
        };
        valid.then_some(key)
    }

    /// Recovers the padded user password from an owner password (Algorithm 7).
    fn decode_user_password(&self, owner: &[u8]) -> Vec<u8> {
        let mut hash = calculate_md5(&pad_password(owner));
        if self.revision >= 3 {
            for _ in 0..50 {
                hash = calculate_md5(&hash);
            }
        }
        let key = &hash[..self.key_length];
        if self.revision >= 3 {
            rc4_rounds(key, self.owner_password, true)
        } else {
            ARC4Cipher::new(key).encrypt_block(self.owner_password)
        }
    }
}

fn string_entry(dict: &Dict, key: &str) -> PDFResult<Vec<u8>> {
    dict.get(key)
        .and_then(|v| v.as_string())
        .map(<[u8]>::to_vec)
        .ok_or_else(|| PDFError::format_error(format!("Encrypt dictionary is missing /{}", key)))
}

fn integer_entry(dict: &Dict, key: &str) -> Option<i64> {
    dict.get(key).and_then(|v| v.as_number()).map(|n| n as i64)
}

/// Builds per-object cipher transforms for an encrypted document.
#[derive(Debug, Clone)]
pub struct CipherTransformFactory {
    encryption_key: Vec<u8>,
    algorithm: u32,
    revision: u32,
    string_method: CryptMethod,
    stream_method: CryptMethod,
    encrypt_metadata: bool,
    permissions: PDFPermissions,
}

impl CipherTransformFactory {
    /// Validates `password` against the /Encrypt dictionary and derives the file key.
    ///
    /// # Errors
    /// * `PasswordRequired` - no password (or an empty one) was given and the
    ///   empty user password does not open the document
    /// * `PasswordIncorrect` - the given password matches neither the user
    ///   nor the owner password
    /// * `Format` - the dictionary uses an unsupported handler or is malformed
    pub fn new(dict: &Dict, file_id: &[u8], password: Option<&[u8]>) -> PDFResult<Self> {
        let filter = dict.get("Filter").and_then(|f| f.as_name()).unwrap_or("");
        if filter != "Standard" {
            return Err(PDFError::format_error(format!("Unknown encryption method: {}", filter)));
        }

        let algorithm = integer_entry(dict, "V").unwrap_or(0) as u32;
        if !matches!(algorithm, 1 | 2 | 4 | 5) {
            return Err(PDFError::format_error(format!("Unsupported encryption algorithm: {}", algorithm)));
        }
        let revision = integer_entry(dict, "R").unwrap_or(0) as u32;
        let flags = integer_entry(dict, "P").unwrap_or(0) as i32;
        let owner_bytes = string_entry(dict, "O")?;
        let user_bytes = string_entry(dict, "U")?;

        let encrypt_metadata = !(algorithm >= 4
            && dict.get("EncryptMetadata").and_then(|v| v.as_boolean()) == Some(false));

        let cf = dict.get("CF").and_then(|v| v.as_dictionary());
        let (string_method, stream_method) = if algorithm >= 4 {
            (
                crypt_method(cf, dict.get("StrF").and_then(|v| v.as_name()))?,
                crypt_method(cf, dict.get("StmF").and_then(|v| v.as_name()))?,
            )
        } else {
            (CryptMethod::RC4, CryptMethod::RC4)
        };

        let password = password.unwrap_or_default();
        let encryption_key = if algorithm == 5 {
            aes256_file_key(revision, password, &owner_bytes, &user_bytes, dict)?
        } else {
            let key_bits = key_length_bits(dict, algorithm, cf)?;
            let params = KeyParams {
                file_id,
                owner_password: &owner_bytes[..owner_bytes.len().min(32)],
                user_password: &user_bytes[..user_bytes.len().min(32)],
                flags,
                revision,
                key_length: key_bits / 8,
                encrypt_metadata,
            };
            match params.check_user_password(password) {
                Some(key) => Some(key),
                None if password.is_empty() => None,
                None => {
                    let decoded = params.decode_user_password(password);
                    params.check_user_password(&decoded)
                }
            }
        };

        let Some(encryption_key) = encryption_key else {
            return Err(if password.is_empty() {
                PDFError::PasswordRequired
            } else {
                PDFError::PasswordIncorrect
            });
        };

        log::debug!(
            "Encryption V{} R{}: strings {:?}, streams {:?}",
            algorithm, revision, string_method, stream_method
        );

        Ok(CipherTransformFactory {
            encryption_key,
            algorithm,
            revision,
            string_method,
            stream_method,
            encrypt_metadata,
            permissions: PDFPermissions::from_p_value(flags),
        })
    }

    pub fn algorithm(&self) -> u32 {
        self.algorithm
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// False when /EncryptMetadata is false; metadata streams are then stored in the clear.
    pub fn encrypt_metadata(&self) -> bool {
        self.encrypt_metadata
    }

    pub fn permissions(&self) -> PDFPermissions {
        self.permissions
    }

    /// Creates the transform for object `num gen`.
    pub fn create_cipher_transform(&self, num: u32, generation: u32) -> CipherTransform {
        CipherTransform {
            string_cipher: self.object_cipher(self.string_method, num, generation),
            stream_cipher: self.object_cipher(self.stream_method, num, generation),
        }
    }

    fn object_cipher(&self, method: CryptMethod, num: u32, generation: u32) -> ObjectCipher {
        match method {
            CryptMethod::Identity => ObjectCipher::Identity,
            CryptMethod::RC4 => ObjectCipher::RC4(self.object_key(num, generation, false)),
            CryptMethod::AESV2 => {
                let mut key = [0u8; 16];
                let object_key = self.object_key(num, generation, true);
                key.copy_from_slice(&object_key[..16]);
                ObjectCipher::AES128(key)
            }
            CryptMethod::AESV3 => {
                let mut key = [0u8; 32];
                let len = self.encryption_key.len().min(32);
                key[..len].copy_from_slice(&self.encryption_key[..len]);
                ObjectCipher::AES256(key)
            }
        }
    }

    /// Per-object key: MD5(file key ‖ num ‖ gen ‖ "sAlT" for AES).
    fn object_key(&self, num: u32, generation: u32, is_aes: bool) -> Vec<u8> {
        let mut data = self.encryption_key.clone();
        data.extend_from_slice(&num.to_le_bytes()[..3]);
        data.extend_from_slice(&generation.to_le_bytes()[..2]);
        if is_aes {
            data.extend_from_slice(b"sAlT");
        }
        let hash = calculate_md5(&data);
        let len = (self.encryption_key.len() + 5).min(16);
        hash[..len].to_vec()
    }
}

fn key_length_bits(dict: &Dict, algorithm: u32, cf: Option<&Dict>) -> PDFResult<usize> {
    let mut bits = integer_entry(dict, "Length").unwrap_or(0);
    if bits == 0 {
        if algorithm <= 3 {
            bits = 40;
        } else {
            let handler = dict
                .get("StmF")
                .and_then(|v| v.as_name())
                .and_then(|name| cf.and_then(|cf| cf.get(name)))
                .and_then(|v| v.as_dictionary());
            bits = handler.and_then(|h| integer_entry(h, "Length")).unwrap_or(128);
            if bits < 40 {
                // Some writers store the crypt filter length in bytes
                bits <<= 3;
            }
        }
    }
    if !(40..=128).contains(&bits) || bits % 8 != 0 {
        return Err(PDFError::format_error(format!("Invalid key length: {}", bits)));
    }
    Ok(bits as usize)
}

fn crypt_method(cf: Option<&Dict>, name: Option<&str>) -> PDFResult<CryptMethod> {
    let Some(name) = name else {
        return Ok(CryptMethod::Identity);
    };
    if name == "Identity" {
        return Ok(CryptMethod::Identity);
    }
    let cfm = cf
        .and_then(|cf| cf.get(name))
        .and_then(|filter| filter.get("CFM"))
        .and_then(|cfm| cfm.as_name());
    match cfm {
        None | Some("None") => Ok(CryptMethod::Identity),
        Some("V2") => Ok(CryptMethod::RC4),
        Some("AESV2") => Ok(CryptMethod::AESV2),
        Some("AESV3") => Ok(CryptMethod::AESV3),
        Some(other) => Err(PDFError::format_error(format!("Unknown crypto method: {}", other))),
    }
}

/// Validates a password for the AES-256 revisions and unwraps the file key.
fn aes256_file_key(
    revision: u32,
    password: &[u8],
    owner_bytes: &[u8],
    user_bytes: &[u8],
    dict: &Dict,
) -> PDFResult<Option<Vec<u8>>> {
    if owner_bytes.len() < 48 || user_bytes.len() < 48 {
        return Err(PDFError::format_error("AES-256 /O and /U must be 48 bytes"));
    }
    let password = &password[..password.len().min(MAX_AES256_PASSWORD)];
    let algorithm: &dyn PDFPasswordAlgorithm = if revision == 6 { &PDF20 } else { &PDF17 };

    let (owner_password, owner_validation_salt, owner_key_salt) =
        (&owner_bytes[..32], &owner_bytes[32..40], &owner_bytes[40..48]);
    let (user_password, user_validation_salt, user_key_salt) =
        (&user_bytes[..32], &user_bytes[32..40], &user_bytes[40..48]);
    let u_bytes = &user_bytes[..48];

    if algorithm.check_user_password(password, user_validation_salt, user_password) {
        let ue = string_entry(dict, "UE")?;
        return algorithm.get_user_key(password, user_key_salt, &ue).map(Some);
    }
    if !password.is_empty()
        && algorithm.check_owner_password(password, owner_validation_salt, u_bytes, owner_password)
    {
        let oe = string_entry(dict, "OE")?;
        return algorithm.get_owner_key(password, owner_key_salt, u_bytes, &oe).map(Some);
    }
    Ok(None)
}

#[derive(Debug, Clone)]
enum ObjectCipher {
    Identity,
    RC4(Vec<u8>),
    AES128([u8; 16]),
    AES256([u8; 32]),
}

impl ObjectCipher {
    fn decrypt(&self, data: &[u8]) -> PDFResult<Vec<u8>> {
        match self {
            ObjectCipher::Identity => Ok(data.to_vec()),
            ObjectCipher::RC4(key) => Ok(ARC4Cipher::new(key).encrypt_block(data)),
            ObjectCipher::AES128(_) if data.is_empty() => Ok(Vec::new()),
            ObjectCipher::AES128(key) => AES128Cipher::new(key).decrypt(data),
            ObjectCipher::AES256(_) if data.is_empty() => Ok(Vec::new()),
            ObjectCipher::AES256(key) => AES256Cipher::new(key).decrypt(data),
        }
    }
}

/// String and stream ciphers for one indirect object.
#[derive(Debug, Clone)]
pub struct CipherTransform {
    string_cipher: ObjectCipher,
    stream_cipher: ObjectCipher,
}

impl CipherTransform {
    pub fn decrypt_string(&self, data: &[u8]) -> PDFResult<Vec<u8>> {
        self.string_cipher.decrypt(data)
    }

    pub fn decrypt_stream(&self, data: &[u8]) -> PDFResult<Vec<u8>> {
        self.stream_cipher.decrypt(data)
    }

    /// Decrypts every string and stream payload inside `obj`.
    ///
    /// A string that fails to decrypt is kept as stored.
    pub fn decrypt_object(&self, obj: PDFObject) -> PDFResult<PDFObject> {
        Ok(match obj {
            PDFObject::String(data) => PDFObject::String(self.decrypt_or_keep(data)),
            PDFObject::HexString(data) => PDFObject::HexString(self.decrypt_or_keep(data)),
            PDFObject::Array(items) => PDFObject::Array(
                items
                    .into_iter()
                    .map(|item| self.decrypt_object(*item).map(Box::new))
                    .collect::<PDFResult<_>>()?,
            ),
            PDFObject::Dictionary(dict) => PDFObject::Dictionary(self.decrypt_dict(dict)?),
            PDFObject::Stream { dict, data } => PDFObject::Stream {
                dict: self.decrypt_dict(dict)?,
                data: self.decrypt_stream(&data)?,
            },
            other => other,
        })
    }

    fn decrypt_dict(&self, dict: Dict) -> PDFResult<Dict> {
        dict.into_iter()
            .map(|(key, value)| Ok((key, self.decrypt_object(value)?)))
            .collect()
    }

    fn decrypt_or_keep(&self, data: Vec<u8>) -> Vec<u8> {
        match self.decrypt_string(&data) {
            Ok(plain) => plain,
            Err(e) => {
                log::warn!("Failed to decrypt string: {}", e);
                data
            }
        }
    }
}
