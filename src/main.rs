use pdf_engine::core::{
    AnnotationData, DocumentInfo, LoadOptions, OpCode, OutlineItem, PdfManager, RenderingIntent,
};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::process;

#[tokio::main]
async fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("PDF Document Inspector");
        eprintln!("Usage: {} <pdf-file> [page-number]", args[0]);
        eprintln!("\nWithout a page number the document summary and page sizes are shown.");
        eprintln!("With a page number (1-based) that page's operators, text and annotations are shown.");
        eprintln!("Set RUST_LOG=debug for parser diagnostics.");
        process::exit(1);
    }

    let pdf_path = &args[1];
    if !Path::new(pdf_path).exists() {
        eprintln!("Error: File not found: {}", pdf_path);
        process::exit(1);
    }

    let page_number = match args.get(2).map(|arg| arg.parse::<usize>()) {
        None => None,
        Some(Ok(n)) if n >= 1 => Some(n),
        Some(_) => {
            eprintln!("Error: page number must be a positive integer");
            process::exit(1);
        }
    };

    let data = match fs::read(pdf_path) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("Error reading {}: {}", pdf_path, e);
            process::exit(1);
        }
    };
    let file_size = data.len();

    let manager = PdfManager::local(1, data, LoadOptions::default());
    if let Err(e) = manager.load_document(None).await {
        eprintln!("Error parsing PDF: {}", e);
        process::exit(1);
    }

    println!("╔═══════════════════════════════════════════════════════════╗");
    println!("║           PDF Document Inspector                          ║");
    println!("╚═══════════════════════════════════════════════════════════╝");
    println!("\nFile: {} ({})\n", pdf_path, format_size(file_size));

    let num_pages = match manager.num_pages().await {
        Ok(n) => n,
        Err(e) => {
            eprintln!("Error counting pages: {}", e);
            process::exit(1);
        }
    };

    match page_number {
        None => show_document(&manager, num_pages).await,
        Some(n) if n > num_pages => {
            eprintln!("Error: page {} requested, document has {} pages", n, num_pages);
            process::exit(1);
        }
        Some(n) => show_page(&manager, n - 1).await,
    }
}

fn format_size(size: usize) -> String {
    if size < 1024 {
        format!("{} B", size)
    } else if size < 1024 * 1024 {
        format!("{:.2} KB", size as f64 / 1024.0)
    } else {
        format!("{:.2} MB", size as f64 / (1024.0 * 1024.0))
    }
}

async fn show_document(manager: &PdfManager, num_pages: usize) {
    println!("═══════════════ BASIC INFORMATION ═══════════════");
    println!("Page Count: {}", num_pages);
    match manager.fingerprint().await {
        Ok(fingerprint) => println!("Fingerprint: {}", fingerprint),
        Err(e) => println!("Fingerprint: unavailable ({})", e),
    }
    match manager.document_info().await {
        Ok(info) => print_document_info(&info),
        Err(e) => println!("Error retrieving document info: {}", e),
    }
    println!();

    if let Ok(Some(outline)) = manager.outline().await {
        println!("═══════════════ DOCUMENT OUTLINE ═══════════════");
        print_outline(&outline, 0);
        println!();
    }

    println!("═══════════════ PAGE SIZES ═══════════════");
    for page_index in 0..num_pages {
        match manager.page_info(page_index).await {
            Ok(info) => println!(
                "Page {}: {:.1} x {:.1} pt, rotate {}",
                page_index + 1,
                info.view[2] - info.view[0],
                info.view[3] - info.view[1],
                info.rotate
            ),
            Err(e) => println!("Page {}: error ({})", page_index + 1, e),
        }
    }
}

fn print_document_info(info: &DocumentInfo) {
    let fields = [
        ("PDF Version", &info.pdf_format_version),
        ("Title", &info.title),
        ("Author", &info.author),
        ("Subject", &info.subject),
        ("Creator", &info.creator),
        ("Producer", &info.producer),
        ("Created", &info.creation_date),
        ("Modified", &info.mod_date),
    ];
    for (label, value) in fields {
        if let Some(value) = value {
            println!("{}: {}", label, value);
        }
    }
    println!("Linearized: {}", if info.is_linearized { "Yes" } else { "No" });
    println!("Encrypted: {}", if info.encrypted { "Yes" } else { "No" });
    if info.is_acroform_present {
        println!("AcroForm: Yes");
    }
}

fn print_outline(items: &[OutlineItem], depth: usize) {
    for item in items {
        let target = match item.page_index {
            Some(index) => format!(" (page {})", index + 1),
            None => item.url.as_ref().map(|url| format!(" ({})", url)).unwrap_or_default(),
        };
        println!("{}- {}{}", "  ".repeat(depth), item.title, target);
        print_outline(&item.items, depth + 1);
    }
}

async fn show_page(manager: &PdfManager, page_index: usize) {
    println!("═══════════════ PAGE {} ═══════════════", page_index + 1);
    if let Ok(info) = manager.page_info(page_index).await {
        println!("View: {:?}", info.view);
        println!("Rotate: {}", info.rotate);
    }
    println!();

    let task = manager.create_task(format!("inspect page {}", page_index + 1));
    println!("═══════════════ OPERATOR LIST ═══════════════");
    match manager
        .get_operator_list(page_index, RenderingIntent::Display, &task, None)
        .await
    {
        Ok(op_list) => {
            let mut counts: BTreeMap<u8, (OpCode, usize)> = BTreeMap::new();
            for op in op_list.fn_array() {
                counts.entry(op.code()).or_insert((*op, 0)).1 += 1;
            }
            println!("Operators: {}", op_list.total_length());
            for (op, count) in counts.values() {
                println!("  {:<28} {}", op, count);
            }
            if !op_list.dependencies().is_empty() {
                println!("Dependencies: {}", op_list.dependencies().join(", "));
            }
        }
        Err(e) => println!("Error building operator list: {}", e),
    }
    println!();

    println!("═══════════════ TEXT CONTENT ═══════════════");
    match manager.get_text_content(page_index, &task).await {
        Ok(content) => println!("{}", content.text()),
        Err(e) => println!("Error extracting text: {}", e),
    }
    println!();

    println!("═══════════════ ANNOTATIONS ═══════════════");
    match manager.get_annotations(page_index, RenderingIntent::Any).await {
        Ok(annotations) if annotations.is_empty() => println!("No annotations"),
        Ok(annotations) => {
            for annotation in annotations {
                let detail = match &annotation.data {
                    AnnotationData::Link { action: Some(action) } => {
                        action.url().map(str::to_string).unwrap_or_else(|| format!("{:?}", action))
                    }
                    AnnotationData::Widget { field_name, field_type, .. } => {
                        format!("{} ({})", field_name, field_type.as_deref().unwrap_or("?"))
                    }
                    _ => annotation.contents.clone(),
                };
                println!(
                    "{} {} at {:?} {}",
                    annotation.id, annotation.subtype, annotation.rect, detail
                );
            }
        }
        Err(e) => println!("Error reading annotations: {}", e),
    }
}
