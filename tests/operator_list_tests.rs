//! Operator list tests: content evaluation, resources, annotations,
//! streaming and cancellation
//!
//! Based on PDF.js's evaluator_spec.js and annotation_spec.js

mod common;

use common::{PdfBuilder, simple_document};
use pdf_engine::core::*;

async fn load(bytes: Vec<u8>) -> PdfManager {
    let manager = PdfManager::local(1, bytes, LoadOptions::default());
    manager.load_document(None).await.unwrap();
    manager
}

async fn operators(content: &str) -> OperatorList {
    let manager = load(simple_document(&[content]).build("/Root 1 0 R")).await;
    let task = manager.create_task("test");
    manager
        .get_operator_list(0, RenderingIntent::Display, &task, None)
        .await
        .unwrap()
}

/// A one-page document whose page uses the given resources dictionary.
fn page_with_resources(content: &str, resources: &str) -> PdfBuilder {
    PdfBuilder::new()
        .object(1, "<< /Type /Catalog /Pages 2 0 R >>")
        .object(2, "<< /Type /Pages /Kids [3 0 R] /Count 1 >>")
        .object(
            3,
            &format!("<< /Type /Page /Parent 2 0 R /Contents 4 0 R /Resources {} >>", resources),
        )
        .stream(4, "", content.as_bytes())
}

#[tokio::test]
async fn test_glued_save_restore() {
    let list = operators("qqQQ").await;
    assert_eq!(
        list.fn_array(),
        [OpCode::Save, OpCode::Save, OpCode::Restore, OpCode::Restore]
    );
}

#[tokio::test]
async fn test_glued_fill_and_text_rise() {
    let list = operators("f5 Ts").await;
    assert_eq!(list.fn_array(), [OpCode::Fill, OpCode::SetTextRise]);
    assert_eq!(list.args_array()[1], vec![PDFObject::Number(5.0)]);
}

#[tokio::test]
async fn test_arity_policy() {
    let list = operators("5 1 4 d0").await;
    assert_eq!(list.fn_array(), [OpCode::SetCharWidth]);
    assert_eq!(list.args_array()[0], vec![PDFObject::Number(1.0), PDFObject::Number(4.0)]);

    let list = operators("5 d0").await;
    assert!(list.fn_array().is_empty());
    assert!(list.args_array().is_empty());
}

#[tokio::test]
async fn test_unbalanced_save_is_closed() {
    let list = operators("q 1 0 0 1 10 10 cm 0 0 m").await;
    assert_eq!(list.fn_array().first(), Some(&OpCode::Save));
    assert_eq!(list.fn_array().last(), Some(&OpCode::Restore));
    let saves = list.fn_array().iter().filter(|op| **op == OpCode::Save).count();
    let restores = list.fn_array().iter().filter(|op| **op == OpCode::Restore).count();
    assert_eq!(saves, restores);
}

#[tokio::test]
async fn test_font_dependency_and_set_font() {
    let list = operators("BT /F1 12 Tf (Hi) Tj ET BT /F1 10 Tf ET").await;
    assert_eq!(list.dependencies(), ["g_d1_f100R".to_string()]);

    let set_font = list
        .fn_array()
        .iter()
        .position(|op| *op == OpCode::SetFont)
        .unwrap();
    assert_eq!(list.fn_array()[set_font - 1], OpCode::Dependency);
    assert_eq!(
        list.args_array()[set_font],
        vec![PDFObject::Name("g_d1_f100R".to_string()), PDFObject::Number(12.0)]
    );
    assert!(list.fn_array().contains(&OpCode::ShowText));
}

#[tokio::test]
async fn test_missing_font_uses_error_font() {
    let list = operators("BT /Nope 12 Tf ET").await;
    let set_font = list.fn_array().iter().position(|op| *op == OpCode::SetFont).unwrap();
    assert_eq!(list.args_array()[set_font][0], PDFObject::Name("g_font_error".to_string()));
}

#[tokio::test]
async fn test_form_xobject_is_inlined() {
    let bytes = page_with_resources("/Fm1 Do", "<< /XObject << /Fm1 5 0 R >> >>")
        .stream(
            5,
            "/Type /XObject /Subtype /Form /BBox [0 0 100 50] /Matrix [2 0 0 2 0 0]",
            b"q 0 0 m",
        )
        .build("/Root 1 0 R");
    let manager = load(bytes).await;
    let task = manager.create_task("form");
    let list = manager
        .get_operator_list(0, RenderingIntent::Display, &task, None)
        .await
        .unwrap();

    assert_eq!(
        list.fn_array(),
        [
            OpCode::PaintFormXObjectBegin,
            OpCode::Save,
            OpCode::MoveTo,
            OpCode::Restore,
            OpCode::PaintFormXObjectEnd,
        ]
    );
    assert_eq!(
        list.args_array()[0][1],
        PDFObject::array([0.0, 0.0, 100.0, 50.0].map(PDFObject::Number))
    );
}

#[tokio::test]
async fn test_tiling_pattern_dependencies_reach_page() {
    let bytes = page_with_resources("/Pattern cs /P1 scn 0 0 10 10 re f", "<< /Pattern << /P1 5 0 R >> >>")
        .stream(
            5,
            "/PatternType 1 /PaintType 1 /TilingType 1 /BBox [0 0 10 10] /XStep 10 /YStep 10 \
             /Resources << /Font << /F1 6 0 R >> >>",
            b"BT /F1 8 Tf ET",
        )
        .object(6, "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>")
        .build("/Root 1 0 R");
    let manager = load(bytes).await;
    let task = manager.create_task("tiling");
    let list = manager
        .get_operator_list(0, RenderingIntent::Display, &task, None)
        .await
        .unwrap();

    assert_eq!(list.dependencies(), ["g_d1_f6R".to_string()]);
    let fill = list
        .fn_array()
        .iter()
        .position(|op| *op == OpCode::SetFillColorN)
        .unwrap();
    assert_eq!(list.fn_array()[fill - 1], OpCode::Dependency);
    assert_eq!(list.args_array()[fill][0], PDFObject::Name("TilingPattern".to_string()));
}

#[tokio::test]
async fn test_self_referencing_form_terminates() {
    let bytes = page_with_resources("/Fm1 Do", "<< /XObject << /Fm1 5 0 R >> >>")
        .stream(
            5,
            "/Type /XObject /Subtype /Form /Resources << /XObject << /Fm1 5 0 R >> >>",
            b"/Fm1 Do",
        )
        .build("/Root 1 0 R");
    let manager = load(bytes).await;
    let task = manager.create_task("recursive form");
    let list = manager
        .get_operator_list(0, RenderingIntent::Display, &task, None)
        .await
        .unwrap();

    let begins = list
        .fn_array()
        .iter()
        .filter(|op| **op == OpCode::PaintFormXObjectBegin)
        .count();
    assert_eq!(begins, EvaluatorOptions::default().max_form_depth);
}

#[tokio::test]
async fn test_image_xobject() {
    let bytes = page_with_resources("/Im1 Do", "<< /XObject << /Im1 5 0 R >> >>")
        .stream(
            5,
            "/Type /XObject /Subtype /Image /Width 2 /Height 1 /ColorSpace /DeviceGray /BitsPerComponent 8",
            &[0, 255],
        )
        .build("/Root 1 0 R");
    let manager = load(bytes).await;
    let task = manager.create_task("image");
    let list = manager
        .get_operator_list(0, RenderingIntent::Display, &task, None)
        .await
        .unwrap();

    assert_eq!(list.fn_array(), [OpCode::Dependency, OpCode::PaintImageXObject]);
    let PDFObject::Name(id) = &list.args_array()[1][0] else {
        panic!("image id should be a name");
    };
    assert!(id.starts_with("img_p0_"));
    assert_eq!(list.dependencies(), [id.clone()]);
}

#[tokio::test]
async fn test_broken_resource_is_skipped() {
    let bytes = page_with_resources("/Im1 Do 0 0 m", "<< /XObject << /Im1 5 0 R >> >>")
        .stream(5, "/Type /XObject /Subtype /Image /Width 0 /Height 0", &[])
        .build("/Root 1 0 R");
    let manager = load(bytes).await;
    let task = manager.create_task("broken image");
    let list = manager
        .get_operator_list(0, RenderingIntent::Display, &task, None)
        .await
        .unwrap();
    assert_eq!(list.fn_array(), [OpCode::MoveTo]);
}

fn annotated_document(flags: u32) -> Vec<u8> {
    page_with_resources("0 0 m", "<< >>")
        .object(
            3,
            "<< /Type /Page /Parent 2 0 R /Contents 4 0 R /Annots [6 0 R 8 0 R] >>",
        )
        .object(
            6,
            &format!(
                "<< /Type /Annot /Subtype /Square /Rect [10 10 110 60] /F {} /AP << /N 7 0 R >> >>",
                flags
            ),
        )
        .stream(7, "/Type /XObject /Subtype /Form /BBox [0 0 50 25]", b"0 0 50 25 re f")
        .object(8, "<< /Type /Annot /Subtype /Popup /Rect [0 0 1 1] >>")
        .build("/Root 1 0 R")
}

#[tokio::test]
async fn test_annotation_appearance_is_wrapped() {
    let manager = load(annotated_document(4)).await;
    let task = manager.create_task("annotations");
    let list = manager
        .get_operator_list(0, RenderingIntent::Display, &task, None)
        .await
        .unwrap();

    assert_eq!(
        list.fn_array(),
        [
            OpCode::MoveTo,
            OpCode::BeginAnnotations,
            OpCode::BeginAnnotation,
            OpCode::Rectangle,
            OpCode::Fill,
            OpCode::EndAnnotation,
            OpCode::EndAnnotations,
        ]
    );
    let begin = &list.args_array()[2];
    assert_eq!(begin[0], PDFObject::Name("6R".to_string()));
    assert_eq!(begin[1], PDFObject::array([10.0, 10.0, 110.0, 60.0].map(PDFObject::Number)));
    assert_eq!(begin[2], PDFObject::array([2.0, 0.0, 0.0, 2.0, 10.0, 10.0].map(PDFObject::Number)));
}

#[tokio::test]
async fn test_annotations_filtered_by_intent() {
    // NOVIEW: printable but not viewable
    let manager = load(annotated_document(4 | 0x20)).await;
    let task = manager.create_task("intent");

    let display = manager
        .get_operator_list(0, RenderingIntent::Display, &task, None)
        .await
        .unwrap();
    assert!(!display.fn_array().contains(&OpCode::BeginAnnotation));

    let print = manager
        .get_operator_list(0, RenderingIntent::Print, &task, None)
        .await
        .unwrap();
    assert!(print.fn_array().contains(&OpCode::BeginAnnotation));

    // The popup never shows up
    let all = manager.get_annotations(0, RenderingIntent::Any).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].subtype, "Square");
    assert!(manager.get_annotations(0, RenderingIntent::Display).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_chunks_are_streamed() {
    let content = "0 0 m ".repeat(25);
    let manager = PdfManager::local(
        1,
        simple_document(&[&content]).build("/Root 1 0 R"),
        LoadOptions {
            evaluator: EvaluatorOptions {
                flush_threshold: 10,
                ..EvaluatorOptions::default()
            },
            ..LoadOptions::default()
        },
    );
    manager.load_document(None).await.unwrap();
    let task = manager.create_task("stream");
    let (sink, mut chunks) = manager.operator_list_channel();

    let list = manager
        .get_operator_list(0, RenderingIntent::Display, &task, Some(sink))
        .await
        .unwrap();
    assert_eq!(list.length(), 0);
    // The list owns the sender; the channel closes once it is gone
    drop(list);

    let mut received = Vec::new();
    while let Some(chunk) = chunks.recv().await {
        received.push(chunk);
    }
    assert_eq!(received.len(), 3);
    assert!(received[..2].iter().all(|chunk| !chunk.last_chunk && chunk.fn_array.len() == 10));
    let last = received.last().unwrap();
    assert!(last.last_chunk);
    assert_eq!(last.total_length, 25);
}

#[tokio::test]
async fn test_cancelled_task_rejects() {
    let manager = load(simple_document(&["q Q q Q"]).build("/Root 1 0 R")).await;
    let task = manager.create_task("cancelled");
    let (sink, mut chunks) = manager.operator_list_channel();
    manager.terminate();

    let result = manager
        .get_operator_list(0, RenderingIntent::Display, &task, Some(sink))
        .await;
    assert_eq!(result.err(), Some(PDFError::Terminated));
    // Nothing was flushed, so no consumer ever sees a final chunk
    while let Some(chunk) = chunks.recv().await {
        assert!(!chunk.last_chunk);
    }
}

#[tokio::test]
async fn test_text_content() {
    let manager = load(
        simple_document(&["BT /F1 12 Tf 72 700 Td (Hello) Tj 0 -14 Td (World) Tj ET"]).build("/Root 1 0 R"),
    )
    .await;
    let task = manager.create_task("text");
    let content = manager.get_text_content(0, &task).await.unwrap();

    let strings: Vec<&str> = content.items.iter().map(|item| item.str.as_str()).collect();
    assert_eq!(strings, ["Hello", "World"]);
    assert_eq!(content.items[0].transform[4], 72.0);
    assert_eq!(content.items[0].transform[5], 700.0);
    assert_eq!(content.items[1].transform[5], 686.0);
    assert_eq!(content.items[0].font_name, "g_d1_f100R");
    assert!(content.styles.contains_key("g_d1_f100R"));
}

#[tokio::test]
async fn test_pages_evaluate_concurrently() {
    let manager = load(simple_document(&["q Q", "0 0 m", "f"]).build("/Root 1 0 R")).await;
    let tasks: Vec<WorkerTask> = (0..3).map(|i| manager.create_task(format!("page {}", i))).collect();

    let (a, b, c) = tokio::join!(
        manager.get_operator_list(0, RenderingIntent::Display, &tasks[0], None),
        manager.get_operator_list(1, RenderingIntent::Display, &tasks[1], None),
        manager.get_operator_list(2, RenderingIntent::Display, &tasks[2], None),
    );
    assert_eq!(a.unwrap().fn_array(), [OpCode::Save, OpCode::Restore]);
    assert_eq!(b.unwrap().fn_array(), [OpCode::MoveTo]);
    assert_eq!(c.unwrap().fn_array(), [OpCode::Fill]);
}
