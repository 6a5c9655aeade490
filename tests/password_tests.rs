//! Encrypted document tests: password errors and the password retry loop

mod common;

use common::simple_document;
use pdf_engine::core::crypto::{ARC4Cipher, calculate_md5};
use pdf_engine::core::*;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

const PASSWORD_PAD: [u8; 32] = [
    0x28, 0xbf, 0x4e, 0x5e, 0x4e, 0x75, 0x8a, 0x41, 0x64, 0x00, 0x4e, 0x56, 0xff, 0xfa, 0x01, 0x08,
    0x2e, 0x2e, 0x00, 0xb6, 0xd0, 0x68, 0x3e, 0x80, 0x2f, 0x0c, 0xa9, 0xfe, 0x64, 0x53, 0x69, 0x7a,
];
const FILE_ID: [u8; 16] = *b"0123456789abcdef";
const PERMISSIONS: i32 = -1028;
const INFO_NUM: u32 = 40;

fn pad(password: &[u8]) -> Vec<u8> {
    password.iter().chain(PASSWORD_PAD.iter()).take(32).copied().collect()
}

/// A revision 2 (40-bit RC4) document with an encrypted /Title.
fn encrypted_document(user: &[u8], owner: &[u8]) -> Vec<u8> {
    let owner_key = calculate_md5(&pad(owner));
    let o = ARC4Cipher::new(&owner_key[..5]).encrypt_block(&pad(user));

    let mut key_input = pad(user);
    key_input.extend_from_slice(&o);
    key_input.extend_from_slice(&PERMISSIONS.to_le_bytes());
    key_input.extend_from_slice(&FILE_ID);
    let file_key = calculate_md5(&key_input)[..5].to_vec();
    let u = ARC4Cipher::new(&file_key).encrypt_block(&PASSWORD_PAD);

    let mut object_key_input = file_key.clone();
    object_key_input.extend_from_slice(&INFO_NUM.to_le_bytes()[..3]);
    object_key_input.extend_from_slice(&[0, 0]);
    let object_key = calculate_md5(&object_key_input);
    let title = ARC4Cipher::new(&object_key[..10]).encrypt_block(b"Secret Plans");

    simple_document(&[""])
        .object(INFO_NUM, &format!("<< /Title <{}> >>", hex::encode(title)))
        .object(
            41,
            &format!(
                "<< /Filter /Standard /V 1 /R 2 /Length 40 /P {} /O <{}> /U <{}> >>",
                PERMISSIONS,
                hex::encode(o),
                hex::encode(u)
            ),
        )
        .build(&format!(
            "/Root 1 0 R /Info {} 0 R /Encrypt 41 0 R /ID [<{}> <{}>]",
            INFO_NUM,
            hex::encode(FILE_ID),
            hex::encode(FILE_ID)
        ))
}

#[test]
fn test_password_errors_are_distinct() {
    let bytes = encrypted_document(b"secret", b"owner");
    assert_eq!(
        PDFDocument::open(bytes.clone()).err(),
        Some(PDFError::PasswordRequired)
    );
    assert_eq!(
        PDFDocument::open_with_password(bytes.clone(), Some(b"wrong".to_vec())).err(),
        Some(PDFError::PasswordIncorrect)
    );

    let doc = PDFDocument::open_with_password(bytes, Some(b"secret".to_vec())).unwrap();
    let info = doc.document_info().unwrap();
    assert!(info.encrypted);
    assert_eq!(info.title.as_deref(), Some("Secret Plans"));
}

#[test]
fn test_owner_password_opens() {
    let bytes = encrypted_document(b"secret", b"owner");
    let doc = PDFDocument::open_with_password(bytes, Some(b"owner".to_vec())).unwrap();
    assert_eq!(doc.document_info().unwrap().title.as_deref(), Some("Secret Plans"));
}

#[tokio::test]
async fn test_without_provider_error_surfaces() {
    let manager = PdfManager::local(1, encrypted_document(b"secret", b"owner"), LoadOptions::default());
    assert_eq!(manager.load_document(None).await.err(), Some(PDFError::PasswordRequired));
}

#[tokio::test]
async fn test_provider_is_asked_until_correct() {
    let manager = PdfManager::local(1, encrypted_document(b"secret", b"owner"), LoadOptions::default());
    let reasons = Mutex::new(Vec::new());
    let answers = Mutex::new(vec![b"secret".to_vec(), b"guess".to_vec()]);
    let provider = |reason: PasswordReason| {
        reasons.lock().unwrap().push(reason);
        answers.lock().unwrap().pop()
    };

    let document = manager.load_document(Some(&provider)).await.unwrap();
    assert_eq!(
        *reasons.lock().unwrap(),
        [PasswordReason::NeedPassword, PasswordReason::IncorrectPassword]
    );
    assert_eq!(document.document_info().unwrap().title.as_deref(), Some("Secret Plans"));
    assert_eq!(manager.num_pages().await.unwrap(), 1);
}

#[tokio::test]
async fn test_provider_giving_up_surfaces_error() {
    let manager = PdfManager::local(1, encrypted_document(b"secret", b"owner"), LoadOptions::default());
    let provider = |_: PasswordReason| -> Option<Vec<u8>> { None };
    assert_eq!(
        manager.load_document(Some(&provider)).await.err(),
        Some(PDFError::PasswordRequired)
    );
}

#[tokio::test]
async fn test_password_attempts_are_bounded() {
    let manager = PdfManager::local(
        1,
        encrypted_document(b"secret", b"owner"),
        LoadOptions {
            max_password_attempts: 2,
            ..LoadOptions::default()
        },
    );
    let calls = AtomicUsize::new(0);
    let provider = |_: PasswordReason| {
        calls.fetch_add(1, Ordering::SeqCst);
        Some(b"still wrong".to_vec())
    };
    assert_eq!(
        manager.load_document(Some(&provider)).await.err(),
        Some(PDFError::PasswordIncorrect)
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_initial_password_from_options() {
    let manager = PdfManager::local(
        1,
        encrypted_document(b"secret", b"owner"),
        LoadOptions {
            password: Some(b"secret".to_vec()),
            ..LoadOptions::default()
        },
    );
    assert!(manager.load_document(None).await.is_ok());
}
