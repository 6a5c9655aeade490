//! Fixture builder shared by the integration tests.
#![allow(dead_code)]

use flate2::Compression;
use flate2::write::ZlibEncoder;
use pdf_engine::core::network::{RangeRequest, TransportError};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Font object shared by the pages of [`simple_document`].
pub const FONT_NUM: u32 = 100;

/// Writes numbered objects and a classic cross-reference table.
#[derive(Clone)]
pub struct PdfBuilder {
    header: String,
    objects: BTreeMap<u32, Vec<u8>>,
}

impl Default for PdfBuilder {
    fn default() -> Self {
        PdfBuilder::new()
    }
}

impl PdfBuilder {
    pub fn new() -> Self {
        PdfBuilder {
            header: "%PDF-1.7".to_string(),
            objects: BTreeMap::new(),
        }
    }

    pub fn object(mut self, num: u32, body: &str) -> Self {
        self.objects.insert(num, body.as_bytes().to_vec());
        self
    }

    /// A stream object; `entries` are extra dictionary entries besides /Length.
    pub fn stream(mut self, num: u32, entries: &str, data: &[u8]) -> Self {
        let mut body = format!("<< /Length {} {} >>\nstream\n", data.len(), entries).into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(b"\nendstream");
        self.objects.insert(num, body);
        self
    }

    pub fn flate_stream(self, num: u32, entries: &str, data: &[u8]) -> Self {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        let compressed = encoder.finish().unwrap();
        self.stream(num, &format!("/Filter /FlateDecode {}", entries), &compressed)
    }

    fn body(&self) -> (Vec<u8>, BTreeMap<u32, usize>) {
        let mut out = format!("{}\n", self.header).into_bytes();
        let mut offsets = BTreeMap::new();
        for (num, body) in &self.objects {
            offsets.insert(*num, out.len());
            out.extend_from_slice(format!("{} 0 obj\n", num).as_bytes());
            out.extend_from_slice(body);
            out.extend_from_slice(b"\nendobj\n");
        }
        (out, offsets)
    }

    /// Bytes with a valid table. `trailer` holds entries besides /Size.
    pub fn build(&self, trailer: &str) -> Vec<u8> {
        let (mut out, offsets) = self.body();
        let size = offsets.keys().max().map_or(1, |max| max + 1);
        let xref_pos = out.len();
        out.extend_from_slice(format!("xref\n0 {}\n0000000000 65535 f \n", size).as_bytes());
        for num in 1..size {
            match offsets.get(&num) {
                Some(offset) => out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes()),
                None => out.extend_from_slice(b"0000000000 65535 f \n"),
            }
        }
        out.extend_from_slice(
            format!("trailer\n<< /Size {} {} >>\nstartxref\n{}\n%%EOF\n", size, trailer, xref_pos).as_bytes(),
        );
        out
    }

    /// Bytes whose `startxref` points into the middle of the first object.
    pub fn build_with_broken_startxref(&self, trailer: &str) -> Vec<u8> {
        let (mut out, offsets) = self.body();
        let size = offsets.keys().max().map_or(1, |max| max + 1);
        let bogus = offsets.values().next().copied().unwrap_or(0) + 3;
        out.extend_from_slice(
            format!("trailer\n<< /Size {} {} >>\nstartxref\n{}\n%%EOF\n", size, trailer, bogus).as_bytes(),
        );
        out
    }
}

/// Catalog 1, page tree 2 and one page per content string. Page `i` is
/// object `3 + 2i`, its content `4 + 2i`. Every page can use font /F1.
pub fn simple_document(contents: &[&str]) -> PdfBuilder {
    let kids: Vec<String> = (0..contents.len()).map(|i| format!("{} 0 R", 3 + 2 * i)).collect();
    let mut builder = PdfBuilder::new()
        .object(1, "<< /Type /Catalog /Pages 2 0 R >>")
        .object(
            2,
            &format!(
                "<< /Type /Pages /Kids [{}] /Count {} /MediaBox [0 0 612 792] >>",
                kids.join(" "),
                contents.len()
            ),
        )
        .object(
            FONT_NUM,
            "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica /FirstChar 32 /LastChar 126 /Widths [278 278 355] >>",
        );
    for (i, content) in contents.iter().enumerate() {
        let page = 3 + 2 * i as u32;
        builder = builder
            .object(
                page,
                &format!(
                    "<< /Type /Page /Parent 2 0 R /Contents {} 0 R /Resources << /Font << /F1 {} 0 R >> >> >>",
                    page + 1,
                    FONT_NUM
                ),
            )
            .stream(page + 1, "", content.as_bytes());
    }
    builder
}

/// Serves range requests out of `data` and records each one.
pub fn spawn_transport(data: Vec<u8>) -> (mpsc::Sender<RangeRequest>, Arc<Mutex<Vec<(usize, usize)>>>) {
    let (tx, mut rx) = mpsc::channel::<RangeRequest>(8);
    let log = Arc::new(Mutex::new(Vec::new()));
    let requests = Arc::clone(&log);
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            requests.lock().unwrap().push((request.begin, request.end));
            let end = request.end.min(data.len());
            let _ = request.reply.send(Ok(data[request.begin..end].to_vec()));
        }
    });
    (tx, log)
}

/// A transport that answers every request with `error`.
pub fn spawn_failing_transport(error: TransportError) -> mpsc::Sender<RangeRequest> {
    let (tx, mut rx) = mpsc::channel::<RangeRequest>(8);
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let _ = request.reply.send(Err(error.clone()));
        }
    });
    tx
}
