//! Progressive loading tests
//!
//! Network documents are read through a channel transport that records every
//! range request. Operations that hit missing bytes are retried once the
//! range has arrived, so results match a fully loaded document.
//!
//! Based on PDF.js's network_spec.js and api_spec.js

mod common;

use common::{PdfBuilder, simple_document, spawn_failing_transport, spawn_transport};
use pdf_engine::core::*;

const CHUNK_SIZE: usize = 1024;
const FILLER_NUM: u32 = 50;
const FILLER_LEN: usize = 40_000;

fn network_options() -> LoadOptions {
    LoadOptions {
        chunk_size: CHUNK_SIZE,
        ..LoadOptions::default()
    }
}

/// Two text pages plus a large stream nothing on the pages refers to.
fn document_with_filler() -> Vec<u8> {
    simple_document(&[
        "BT /F1 12 Tf 72 700 Td (Hello) Tj ET",
        "q 0 0 10 10 re f Q BT /F1 10 Tf (Second) Tj ET",
    ])
    .stream(FILLER_NUM, "", &vec![b'x'; FILLER_LEN])
    .build("/Root 1 0 R")
}

fn network_manager(bytes: &[u8]) -> (PdfManager, std::sync::Arc<std::sync::Mutex<Vec<(usize, usize)>>>) {
    let (transport, requests) = spawn_transport(bytes.to_vec());
    let manager = PdfManager::network(1, bytes.len(), transport, network_options());
    (manager, requests)
}

#[tokio::test]
async fn test_network_load_matches_local() {
    let bytes = document_with_filler();
    let local = PdfManager::local(1, bytes.clone(), LoadOptions::default());
    local.load_document(None).await.unwrap();
    let (network, _) = network_manager(&bytes);
    network.load_document(None).await.unwrap();

    assert!(network.source().is_network());
    assert_eq!(network.num_pages().await.unwrap(), 2);
    assert_eq!(network.fingerprint().await.unwrap(), local.fingerprint().await.unwrap());

    for page_index in 0..2 {
        let task = network.create_task("network");
        let remote = network
            .get_operator_list(page_index, RenderingIntent::Display, &task, None)
            .await
            .unwrap();
        let task = local.create_task("local");
        let resident = local
            .get_operator_list(page_index, RenderingIntent::Display, &task, None)
            .await
            .unwrap();
        assert_eq!(remote.fn_array(), resident.fn_array());
        assert_eq!(remote.dependencies(), resident.dependencies());

        let remote_text = network.get_text_content(page_index, &task).await.unwrap();
        let resident_text = local.get_text_content(page_index, &task).await.unwrap();
        assert_eq!(remote_text.text(), resident_text.text());
    }
}

#[tokio::test]
async fn test_only_needed_chunks_are_requested() {
    let bytes = document_with_filler();
    let (manager, requests) = network_manager(&bytes);
    manager.load_document(None).await.unwrap();
    let task = manager.create_task("page 1");
    manager
        .get_operator_list(0, RenderingIntent::Display, &task, None)
        .await
        .unwrap();

    let requests = requests.lock().unwrap().clone();
    assert!(!requests.is_empty());
    for &(begin, end) in &requests {
        assert_eq!(begin % CHUNK_SIZE, 0, "unaligned request {}..{}", begin, end);
        assert!(end == bytes.len() || end % CHUNK_SIZE == 0, "unaligned request {}..{}", begin, end);
    }
    // No chunk is fetched twice
    let mut sorted = requests.clone();
    sorted.sort();
    assert!(sorted.windows(2).all(|pair| pair[0].1 <= pair[1].0));

    let fetched: usize = requests.iter().map(|(begin, end)| end - begin).sum();
    assert!(fetched < bytes.len() / 2, "fetched {} of {} bytes", fetched, bytes.len());
}

#[tokio::test]
async fn test_concurrent_pages_over_network() {
    let bytes = document_with_filler();
    let (manager, _) = network_manager(&bytes);
    manager.load_document(None).await.unwrap();

    let first_task = manager.create_task("first");
    let second_task = manager.create_task("second");
    let (first, second) = tokio::join!(
        manager.get_text_content(0, &first_task),
        manager.get_text_content(1, &second_task),
    );
    assert_eq!(first.unwrap().text().trim_end(), "Hello");
    assert_eq!(second.unwrap().text().trim_end(), "Second");
}

#[tokio::test]
async fn test_recovery_over_network() {
    let bytes = simple_document(&["q Q", "Q q", "q Q"])
        .object(30, "(kept)")
        .build_with_broken_startxref("/Root 1 0 R");
    let (manager, requests) = network_manager(&bytes);
    let document = manager.load_document(None).await.unwrap();

    assert_eq!(manager.num_pages().await.unwrap(), 3);
    assert_eq!(
        *document.xref().fetch(Ref::new(30, 0)).unwrap(),
        PDFObject::String(b"kept".to_vec())
    );
    // Recovery scans the whole file
    let fetched: usize = requests.lock().unwrap().iter().map(|(begin, end)| end - begin).sum();
    assert_eq!(fetched, bytes.len());
}

#[tokio::test]
async fn test_missing_file_error() {
    let transport = spawn_failing_transport(TransportError::MissingFile);
    let manager = PdfManager::network(1, 4096, transport, network_options());
    assert_eq!(manager.load_document(None).await.err(), Some(PDFError::MissingPDF));
}

#[tokio::test]
async fn test_unexpected_response_error() {
    let transport = spawn_failing_transport(TransportError::UnexpectedResponse(500));
    let manager = PdfManager::network(1, 4096, transport, network_options());
    assert_eq!(
        manager.load_document(None).await.err(),
        Some(PDFError::UnexpectedResponse { status: 500 })
    );
}

#[tokio::test]
async fn test_short_document_in_one_chunk() {
    let bytes = PdfBuilder::new()
        .object(1, "<< /Type /Catalog /Pages 2 0 R >>")
        .object(2, "<< /Type /Pages /Kids [] /Count 0 >>")
        .build("/Root 1 0 R");
    assert!(bytes.len() < CHUNK_SIZE);
    let (manager, requests) = network_manager(&bytes);
    manager.load_document(None).await.unwrap();

    assert_eq!(manager.num_pages().await.unwrap(), 0);
    assert_eq!(*requests.lock().unwrap(), [(0, bytes.len())]);
}
