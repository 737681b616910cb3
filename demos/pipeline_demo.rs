//! 流水线演示
//!
//! 使用内存存储和固定输出的模型，对一张合成的血涂片影像跑一次完整诊断。
//!
//! ```text
//! cargo run --example pipeline_demo
//! ```

use anyhow::{Context, Result};
use hemabridge::hema_admin::{init_logging, HemaConfig};
use hemabridge::hema_core::{ChannelFormat, ImageTensor, PatientInfo};
use hemabridge::hema_inference::{BackendError, ModelArtifact, ModelBackend, ModelLoader};
use hemabridge::hema_storage::{DocumentStoreConfig, InMemoryReportRepository};
use hemabridge::hema_workflow::Submission;
use hemabridge::assemble;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// 始终给出相同类别分布的演示模型
struct DemoBackend;

impl ModelBackend for DemoBackend {
    fn forward(&self, _tensor: &ImageTensor) -> std::result::Result<Vec<f32>, BackendError> {
        // monocyte, myeloblast, erythroblast, segmented_neutrophil, basophil
        Ok(vec![0.05, 0.72, 0.08, 0.12, 0.03])
    }
}

struct DemoLoader;

impl ModelLoader for DemoLoader {
    fn load(&self, artifact: &ModelArtifact) -> hemabridge::hema_core::Result<Box<dyn ModelBackend>> {
        info!("Loading demo model in place of {}", artifact.path().display());
        Ok(Box::new(DemoBackend))
    }
}

fn synthetic_smear() -> Result<Vec<u8>> {
    let img = RgbImage::from_fn(256, 256, |x, y| {
        let dx = x as i32 - 128;
        let dy = y as i32 - 128;
        if dx * dx + dy * dy < 60 * 60 {
            Rgb([120, 60, 160])
        } else {
            Rgb([235, 200, 205])
        }
    });
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .context("Failed to encode demo image")?;
    Ok(buf)
}

#[tokio::main]
async fn main() -> Result<()> {
    let workdir = std::env::temp_dir().join("hemabridge-demo");
    std::fs::create_dir_all(&workdir)?;
    let model_path = workdir.join("blood_cancer_model.onnx");
    std::fs::write(&model_path, b"demo weights")?;

    let mut config = HemaConfig::default();
    config.model.path = model_path;
    config.model.channels = ChannelFormat::Rgb;
    config.storage.documents = DocumentStoreConfig::Local {
        root: workdir.join("reports"),
    };
    init_logging(&config.logging)?;

    let pipeline = assemble(
        &config,
        Arc::new(DemoLoader),
        Arc::new(InMemoryReportRepository::new()),
    )?;

    let patient = PatientInfo {
        patient_id: "DEMO-001".to_string(),
        name: Some("Demo Patient".to_string()),
        age: Some(47),
    };
    let submission = Submission::new(patient, "smear.png", synthetic_smear()?);

    let outcome = pipeline
        .orchestrator
        .run(submission, CancellationToken::new())
        .await?;
    let report = &outcome.report;

    println!("Report {}", report.id());
    println!("  {}", report.assessment().headline());
    for finding in &report.assessment().findings {
        println!("  - {}", finding);
    }
    println!("  Recommendations:");
    for recommendation in report.recommendations() {
        println!("    * {}", recommendation);
    }
    println!(
        "  PDF: {}",
        workdir.join("reports").join(&report.document().key).display()
    );

    let session_states: Vec<String> = outcome
        .session
        .history()
        .iter()
        .map(|record| record.state.to_string())
        .collect();
    println!("  Session: {}", session_states.join(" -> "));

    Ok(())
}
