//! AES-encrypted documents: V4 with AESV2 crypt filters and V5 R6 with AESV3
//!
//! Fixtures are encrypted here with the same primitives the security
//! handler uses, then opened and read back through the XRef.

mod common;

use aes::cipher::{BlockEncryptMut, KeyIvInit, block_padding::NoPadding};
use common::simple_document;
use pdf_engine::core::crypto::{ARC4Cipher, AES128Cipher, PDF20, PDFPasswordAlgorithm, calculate_md5};
use pdf_engine::core::*;

const PASSWORD_PAD: [u8; 32] = [
    0x28, 0xbf, 0x4e, 0x5e, 0x4e, 0x75, 0x8a, 0x41, 0x64, 0x00, 0x4e, 0x56, 0xff, 0xfa, 0x01, 0x08,
    0x2e, 0x2e, 0x00, 0xb6, 0xd0, 0x68, 0x3e, 0x80, 0x2f, 0x0c, 0xa9, 0xfe, 0x64, 0x53, 0x69, 0x7a,
];
const FILE_ID: [u8; 16] = *b"fedcba9876543210";
const PERMISSIONS: i32 = -1028;
const INFO_NUM: u32 = 40;
const ENCRYPT_NUM: u32 = 41;
const TITLE: &[u8] = b"Secret Plans";
const STRING_IV: [u8; 16] = [7; 16];

fn pad(password: &[u8]) -> Vec<u8> {
    password.iter().chain(PASSWORD_PAD.iter()).take(32).copied().collect()
}

fn pkcs7(data: &[u8]) -> Vec<u8> {
    let fill = 16 - data.len() % 16;
    let mut padded = data.to_vec();
    padded.extend(std::iter::repeat_n(fill as u8, fill));
    padded
}

fn aes256_cbc(key: &[u8], iv: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let mut buf = data.to_vec();
    let len = buf.len();
    cbc::Encryptor::<aes::Aes256>::new_from_slices(key, iv)
        .unwrap()
        .encrypt_padded_mut::<NoPadding>(&mut buf, len)
        .unwrap()
        .to_vec()
}

/// An AES payload as stored in the file: IV followed by the ciphertext.
fn with_iv(ciphertext: Vec<u8>) -> Vec<u8> {
    let mut out = STRING_IV.to_vec();
    out.extend_from_slice(&ciphertext);
    out
}

fn build_document(encrypt: &str, title: &[u8]) -> Vec<u8> {
    simple_document(&[""])
        .object(INFO_NUM, &format!("<< /Title <{}> >>", hex::encode(title)))
        .object(ENCRYPT_NUM, encrypt)
        .build(&format!(
            "/Root 1 0 R /Info {} 0 R /Encrypt {} 0 R /ID [<{}> <{}>]",
            INFO_NUM,
            ENCRYPT_NUM,
            hex::encode(FILE_ID),
            hex::encode(FILE_ID)
        ))
}

/// A V4 R4 document whose strings use the AESV2 crypt filter.
fn aesv2_document(user: &[u8]) -> Vec<u8> {
    let o = [0x4f_u8; 32];

    let mut key_input = pad(user);
    key_input.extend_from_slice(&o);
    key_input.extend_from_slice(&PERMISSIONS.to_le_bytes());
    key_input.extend_from_slice(&FILE_ID);
    let mut hash = calculate_md5(&key_input);
    for _ in 0..50 {
        hash = calculate_md5(&hash);
    }
    let file_key = hash.to_vec();

    let mut seed = PASSWORD_PAD.to_vec();
    seed.extend_from_slice(&FILE_ID);
    let mut u = calculate_md5(&seed).to_vec();
    for round in 0..20u8 {
        let derived: Vec<u8> = file_key.iter().map(|b| b ^ round).collect();
        u = ARC4Cipher::new(&derived).encrypt_block(&u);
    }
    u.resize(32, 0);

    let mut object_key_input = file_key.clone();
    object_key_input.extend_from_slice(&INFO_NUM.to_le_bytes()[..3]);
    object_key_input.extend_from_slice(&[0, 0]);
    object_key_input.extend_from_slice(b"sAlT");
    let object_key = calculate_md5(&object_key_input);
    let title = with_iv(AES128Cipher::new(&object_key).encrypt_no_padding(&pkcs7(TITLE), &STRING_IV));

    build_document(
        &format!(
            "<< /Filter /Standard /V 4 /R 4 /Length 128 /P {} /O <{}> /U <{}> \
             /CF << /StdCF << /CFM /AESV2 /AuthEvent /DocOpen /Length 16 >> >> /StmF /StdCF /StrF /StdCF >>",
            PERMISSIONS,
            hex::encode(o),
            hex::encode(u)
        ),
        &title,
    )
}

/// A V5 R6 document whose strings use the AESV3 crypt filter.
fn aesv3_document(user: &[u8]) -> Vec<u8> {
    let file_key: Vec<u8> = (0..32u8).map(|b| b.wrapping_mul(37).wrapping_add(11)).collect();
    let validation_salt = [1u8; 8];
    let key_salt = [2u8; 8];

    let mut u = PDF20.hash(user, &validation_salt, &[]).to_vec();
    u.extend_from_slice(&validation_salt);
    u.extend_from_slice(&key_salt);
    let ue = aes256_cbc(&PDF20.hash(user, &key_salt, &[]), &[0; 16], &file_key);

    let o = [0x6f_u8; 48];
    let oe = [0x65_u8; 32];
    let title = with_iv(aes256_cbc(&file_key, &STRING_IV, &pkcs7(TITLE)));

    build_document(
        &format!(
            "<< /Filter /Standard /V 5 /R 6 /Length 256 /P {} /O <{}> /U <{}> /OE <{}> /UE <{}> \
             /CF << /StdCF << /CFM /AESV3 /AuthEvent /DocOpen /Length 32 >> >> /StmF /StdCF /StrF /StdCF >>",
            PERMISSIONS,
            hex::encode(o),
            hex::encode(u),
            hex::encode(oe),
            hex::encode(ue)
        ),
        &title,
    )
}

fn fetched_title(doc: &PDFDocument) -> PDFObject {
    let info = doc.xref().fetch(Ref::new(INFO_NUM, 0)).unwrap();
    info.get("Title").cloned().unwrap_or(PDFObject::Null)
}

#[test]
fn test_aesv2_title_decrypts() {
    let bytes = aesv2_document(b"secret");
    assert_eq!(PDFDocument::open(bytes.clone()).err(), Some(PDFError::PasswordRequired));

    let doc = PDFDocument::open_with_password(bytes, Some(b"secret".to_vec())).unwrap();
    let encrypt = doc.xref().encrypt().unwrap();
    assert_eq!((encrypt.algorithm(), encrypt.revision()), (4, 4));
    assert_eq!(fetched_title(&doc), PDFObject::String(TITLE.to_vec()));
    assert_eq!(doc.document_info().unwrap().title.as_deref(), Some("Secret Plans"));
}

#[test]
fn test_aesv2_wrong_password() {
    let bytes = aesv2_document(b"secret");
    assert_eq!(
        PDFDocument::open_with_password(bytes, Some(b"guess".to_vec())).err(),
        Some(PDFError::PasswordIncorrect)
    );
}

#[test]
fn test_aesv3_title_decrypts() {
    let bytes = aesv3_document(b"secret");
    assert_eq!(PDFDocument::open(bytes.clone()).err(), Some(PDFError::PasswordRequired));

    let doc = PDFDocument::open_with_password(bytes, Some(b"secret".to_vec())).unwrap();
    let encrypt = doc.xref().encrypt().unwrap();
    assert_eq!((encrypt.algorithm(), encrypt.revision()), (5, 6));
    assert_eq!(fetched_title(&doc), PDFObject::String(TITLE.to_vec()));
    assert_eq!(doc.document_info().unwrap().title.as_deref(), Some("Secret Plans"));
}

#[test]
fn test_aesv3_empty_user_password_opens_without_prompt() {
    let doc = PDFDocument::open(aesv3_document(b"")).unwrap();
    assert!(doc.document_info().unwrap().encrypted);
    assert_eq!(fetched_title(&doc), PDFObject::String(TITLE.to_vec()));
}
