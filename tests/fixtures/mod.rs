//! Scan bytes and canned inference responses shared by the integration tests.
#![allow(dead_code)]

use serde_json::{json, Value};

/// PNG signature plus the start of an IHDR chunk; enough for content sniffing.
pub const PNG_SCAN: &[u8] = &[
    0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, b'I', b'H', b'D', b'R',
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00,
];

pub const JPEG_SCAN: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00];

pub const GIF_SCAN: &[u8] = b"GIF89a\x01\x00\x01\x00\x00\x00\x00";

/// 128-byte preamble followed by the `DICM` marker.
pub fn dicom_scan() -> Vec<u8> {
    let mut bytes = vec![0u8; 128];
    bytes.extend_from_slice(b"DICM");
    bytes.extend_from_slice(&[0x02, 0x00, 0x00, 0x00, b'U', b'L']);
    bytes
}

pub fn png_scan() -> Vec<u8> {
    PNG_SCAN.to_vec()
}

pub fn jpeg_scan() -> Vec<u8> {
    JPEG_SCAN.to_vec()
}

pub fn gif_scan() -> Vec<u8> {
    GIF_SCAN.to_vec()
}

pub fn pdf_document() -> Vec<u8> {
    b"%PDF-1.7\n".to_vec()
}

/// An upload case and whether ingestion should accept it.
#[derive(Debug, Clone)]
pub struct ScanFixture {
    pub filename: &'static str,
    pub content_type: &'static str,
    pub bytes: fn() -> Vec<u8>,
    pub accepted: bool,
    pub description: &'static str,
}

pub const SCAN_FIXTURES: &[ScanFixture] = &[
    ScanFixture {
        filename: "chest.png",
        content_type: "image/png",
        bytes: png_scan,
        accepted: true,
        description: "PNG chest x-ray",
    },
    ScanFixture {
        filename: "knee.jpg",
        content_type: "image/jpeg",
        bytes: jpeg_scan,
        accepted: true,
        description: "JPEG knee x-ray",
    },
    ScanFixture {
        filename: "cine.gif",
        content_type: "image/gif",
        bytes: gif_scan,
        accepted: true,
        description: "GIF ultrasound frame",
    },
    ScanFixture {
        filename: "head.dcm",
        content_type: "application/dicom",
        bytes: dicom_scan,
        accepted: true,
        description: "DICOM CT slice",
    },
    ScanFixture {
        filename: "report.pdf",
        content_type: "application/pdf",
        bytes: pdf_document,
        accepted: false,
        description: "PDF report is not a scan",
    },
    ScanFixture {
        filename: "renamed.png",
        content_type: "image/png",
        bytes: jpeg_scan,
        accepted: false,
        description: "JPEG content declared as PNG",
    },
];

/// The two-class chest x-ray response.
pub fn pneumonia_response() -> Value {
    json!({
        "model_version": "chexnet-1.2",
        "inference_id": "inf-001",
        "inference_time_ms": 37.5,
        "predictions": {"pneumonia": 0.82, "normal": 0.18},
        "warnings": []
    })
}

/// A response whose fused diagnosis disagrees with the model's top label.
pub fn fused_response() -> Value {
    json!({
        "model_version": "chexnet-1.2",
        "predictions": {"pneumonia": 0.55, "effusion": 0.41, "normal": 0.04},
        "fusion": {
            "final_diagnosis": "effusion",
            "confidence_score": 0.91,
            "summary": "Imaging and history agree on effusion",
            "flags": ["history_override"]
        },
        "features": {"lung_area_ratio": 0.27}
    })
}

/// A response with scores the service should never have sent.
pub fn malformed_scores_response() -> Value {
    json!({
        "model_version": "chexnet-1.2",
        "findings": {"mass": "likely", "nodule": null, "edema": 1.4, "normal": 0.3}
    })
}
