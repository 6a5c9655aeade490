//! Document model tests: loading, recovery, fingerprints and page attributes
//!
//! Based on PDF.js's document_spec.js and api_spec.js

mod common;

use common::{PdfBuilder, simple_document};
use pdf_engine::core::*;
use std::io::Write;

#[test]
fn test_open_simple_document() {
    let bytes = simple_document(&["BT /F1 12 Tf (Hi) Tj ET", "0 0 m 10 10 l S"]).build("/Root 1 0 R");
    let doc = PDFDocument::open(bytes).unwrap();

    assert_eq!(doc.num_pages().unwrap(), 2);
    assert_eq!(doc.pdf_format_version(), Some("1.7"));

    let page = doc.get_page(1).unwrap();
    assert_eq!(page.page_index(), 1);
    assert_eq!(page.page_ref(), Some(Ref::new(5, 0)));
    assert_eq!(page.media_box(doc.xref()).unwrap(), [0.0, 0.0, 612.0, 792.0]);
    assert_eq!(page.get_content_stream(doc.xref()).unwrap(), b"0 0 m 10 10 l S");
}

#[test]
fn test_fetch_through_xref_table() {
    let bytes = simple_document(&["q Q"])
        .object(20, "<< /Answer 42 /List [1 (two) /Three] >>")
        .build("/Root 1 0 R");
    let doc = PDFDocument::open(bytes).unwrap();

    let obj = doc.xref().fetch(Ref::new(20, 0)).unwrap();
    let dict = obj.as_dictionary().unwrap();
    assert_eq!(dict.get("Answer"), Some(&PDFObject::Number(42.0)));
    assert_eq!(
        dict.get("List"),
        Some(&PDFObject::array([
            PDFObject::Number(1.0),
            PDFObject::String(b"two".to_vec()),
            PDFObject::Name("Three".to_string()),
        ]))
    );
}

#[test]
fn test_flate_content_stream() {
    let bytes = simple_document(&[])
        .object(
            2,
            "<< /Type /Pages /Kids [3 0 R] /Count 1 >>",
        )
        .object(3, "<< /Type /Page /Parent 2 0 R /Contents 4 0 R >>")
        .flate_stream(4, "", b"1 0 0 1 50 50 cm")
        .build("/Root 1 0 R");
    let doc = PDFDocument::open(bytes).unwrap();
    let page = doc.get_page(0).unwrap();
    assert_eq!(page.get_content_stream(doc.xref()).unwrap(), b"1 0 0 1 50 50 cm");
}

#[test]
fn test_recovery_resolves_every_object() {
    let builder = simple_document(&["q Q", "Q q"]).object(30, "(kept)");
    let bytes = builder.build_with_broken_startxref("/Root 1 0 R");
    let doc = PDFDocument::open(bytes).unwrap();

    assert_eq!(doc.num_pages().unwrap(), 2);
    assert_eq!(*doc.xref().fetch(Ref::new(30, 0)).unwrap(), PDFObject::String(b"kept".to_vec()));
    assert_eq!(doc.get_page(1).unwrap().page_ref(), Some(Ref::new(5, 0)));
}

#[test]
fn test_recovery_prefers_last_duplicate() {
    let bytes = b"%PDF-1.4
1 0 obj
<< /Type /Catalog /Pages 2 0 R >>
endobj
2 0 obj
<< /Type /Pages /Kids [] /Count 0 >>
endobj
5 0 obj
(old)
endobj
5 0 obj
(new)
endobj
trailer
<< /Size 6 /Root 1 0 R >>
startxref
12
%%EOF
"
    .to_vec();
    let doc = PDFDocument::open(bytes).unwrap();
    assert_eq!(*doc.xref().fetch(Ref::new(5, 0)).unwrap(), PDFObject::String(b"new".to_vec()));
    assert_eq!(doc.num_pages().unwrap(), 0);
}

#[test]
fn test_garbage_is_rejected() {
    assert!(PDFDocument::open(b"this is not a pdf at all".to_vec()).is_err());
}

#[test]
fn test_fingerprint_from_trailer_id() {
    let bytes = simple_document(&[""]).build(
        "/Root 1 0 R /ID [<00112233445566778899aabbccddeeff> <ffeeddccbbaa99887766554433221100>]",
    );
    let doc = PDFDocument::open(bytes).unwrap();
    assert_eq!(doc.fingerprint().unwrap(), "00112233445566778899aabbccddeeff");
    let (_, modified) = doc.fingerprints().unwrap();
    assert_eq!(modified.as_deref(), Some("ffeeddccbbaa99887766554433221100"));
}

#[test]
fn test_fingerprint_stability_and_uniqueness() {
    let first = simple_document(&["0 0 m"]).build("/Root 1 0 R");
    let second = simple_document(&["1 1 m"]).build("/Root 1 0 R");

    let a = PDFDocument::open(first.clone()).unwrap().fingerprint().unwrap().to_string();
    let b = PDFDocument::open(first).unwrap().fingerprint().unwrap().to_string();
    let c = PDFDocument::open(second).unwrap().fingerprint().unwrap().to_string();

    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(hex::decode(&a).unwrap().len(), 16);
}

#[test]
fn test_document_info() {
    let bytes = simple_document(&[""])
        .object(40, "<< /Title (Quarterly Report) /Author <FEFF004A006F> /Custom /Yes >>")
        .build("/Root 1 0 R /Info 40 0 R");
    let doc = PDFDocument::open(bytes).unwrap();
    let info = doc.document_info().unwrap();
    assert_eq!(info.title.as_deref(), Some("Quarterly Report"));
    assert_eq!(info.author.as_deref(), Some("Jo"));
    assert!(!info.encrypted);
}

#[test]
fn test_inherited_property_merge() {
    // Page 3 has no /Resources; its parent and grandparent each define some
    let bytes = PdfBuilder::new()
        .object(1, "<< /Type /Catalog /Pages 2 0 R >>")
        .object(
            2,
            "<< /Type /Pages /Kids [5 0 R] /Count 1 /Rotate 90 \
             /Resources << /Font << /F1 9 0 R >> /XObject << /Im1 9 0 R >> >> >>",
        )
        .object(
            5,
            "<< /Type /Pages /Parent 2 0 R /Kids [3 0 R] /Count 1 \
             /Resources << /Font << /F2 9 0 R >> /ExtGState << /GS1 9 0 R >> >> >>",
        )
        .object(3, "<< /Type /Page /Parent 5 0 R /MediaBox [0 0 200 100] >>")
        .object(9, "null")
        .build("/Root 1 0 R");
    let doc = PDFDocument::open(bytes).unwrap();
    let page = doc.get_page(0).unwrap();
    let xref = doc.xref();

    let resources = page.resources(xref).unwrap();
    assert!(resources.contains_key("XObject"));
    assert!(resources.contains_key("ExtGState"));
    // Nearest ancestor wins for the colliding /Font key
    let fonts = resources["Font"].as_dictionary().unwrap();
    assert!(fonts.contains_key("F2"));
    assert!(!fonts.contains_key("F1"));

    assert_eq!(page.rotate(xref).unwrap(), 90);
    assert_eq!(page.view(xref).unwrap(), [0.0, 0.0, 200.0, 100.0]);
}

#[test]
fn test_rotation_normalization() {
    for (rotate, expected) in [(-90, 270), (450, 90), (45, 0)] {
        let bytes = PdfBuilder::new()
            .object(1, "<< /Type /Catalog /Pages 2 0 R >>")
            .object(2, "<< /Type /Pages /Kids [3 0 R] /Count 1 >>")
            .object(3, &format!("<< /Type /Page /Parent 2 0 R /Rotate {} >>", rotate))
            .build("/Root 1 0 R");
        let doc = PDFDocument::open(bytes).unwrap();
        let page = doc.get_page(0).unwrap();
        assert_eq!(page.rotate(doc.xref()).unwrap(), expected, "rotate {}", rotate);
    }
}

#[tokio::test]
async fn test_outline_and_destinations() {
    let bytes = simple_document(&[""])
        .object(
            1,
            "<< /Type /Catalog /Pages 2 0 R /Outlines 50 0 R /Names << /Dests 53 0 R >> >>",
        )
        .object(50, "<< /Type /Outlines /First 51 0 R /Last 52 0 R /Count 2 >>")
        .object(51, "<< /Title (Intro) /Parent 50 0 R /Next 52 0 R /Dest [3 0 R /Fit] >>")
        .object(
            52,
            "<< /Title (Site) /Parent 50 0 R /Prev 51 0 R /A << /S /URI /URI (https://example.org) >> >>",
        )
        .object(53, "<< /Names [(start) [3 0 R /XYZ 0 792 null]] >>")
        .build("/Root 1 0 R");

    let manager = PdfManager::local(1, bytes, LoadOptions::default());
    manager.load_document(None).await.unwrap();

    let outline = manager.outline().await.unwrap().unwrap();
    assert_eq!(outline.len(), 2);
    assert_eq!(outline[0].title, "Intro");
    assert_eq!(outline[0].page_index, Some(0));
    assert_eq!(outline[1].url.as_deref(), Some("https://example.org"));

    let destinations = manager.destinations().await.unwrap();
    assert_eq!(destinations["start"][0], PDFObject::Ref(Ref::new(3, 0)));
}

#[tokio::test]
async fn test_load_from_file() {
    let bytes = simple_document(&["BT ET", "BT ET", "BT ET"]).build("/Root 1 0 R");
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&bytes).unwrap();

    let data = std::fs::read(file.path()).unwrap();
    let manager = PdfManager::local(7, data, LoadOptions::default());
    let document = manager.load_document(None).await.unwrap();
    assert_eq!(document.doc_id(), 7);
    assert_eq!(manager.num_pages().await.unwrap(), 3);

    let info = manager.page_info(2).await.unwrap();
    assert_eq!(info.reference, Some(Ref::new(7, 0)));
    assert_eq!(info.view, [0.0, 0.0, 612.0, 792.0]);
    assert!(manager.page_info(3).await.is_err());
}
