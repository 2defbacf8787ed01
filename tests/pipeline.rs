use std::fs;
use std::path::Path;
use serde_json::json;
use tempfile::TempDir;

use engine_pipeline::{run_pipeline, Stage};
use pipeline_config::PipelineConfig;

const H: usize = 1800;
const W: usize = 128;

fn write_model(dir: &Path, name: &str, shift: f32, outputs: &[&str]) {
    let network = json!({
        "name": "beamformer",
        "opset": 1,
        "inputs": [{"name": "data", "dims": [H, W], "dtype": "float32"}],
        "nodes": [
            {"name": "gain", "op": "scale", "scale": 0.5, "shift": shift, "inputs": ["data"], "output": "g"},
            {"name": "clip", "op": "tanh", "inputs": ["g"], "output": "prob"},
            {"name": "aux", "op": "relu", "inputs": ["data"], "output": "aux"}
        ],
        "outputs": outputs
    });
    fs::write(dir.join(name), network.to_string()).unwrap();
}

fn config(dir: &TempDir) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.model.file = "beamformer.json".to_string();
    config.model.search_dirs = vec![dir.path().join("missing"), dir.path().join("models")];
    config.io.input_file = dir.path().join("input.bin");
    config.io.output_file = dir.path().join("out").join("beamformed.bin");
    config
}

fn setup() -> (TempDir, PipelineConfig) {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("models")).unwrap();
    write_model(&dir.path().join("models"), "beamformer.json", 0.25, &["prob"]);
    fs::write(dir.path().join("input.bin"), vec![0u8; H * W * 4]).unwrap();
    let config = config(&dir);
    (dir, config)
}

fn read_f32(path: &Path) -> Vec<f32> {
    fs::read(path)
        .unwrap()
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[tokio::test]
async fn test_zero_input_end_to_end() {
    let (dir, mut config) = setup();
    config.io.echo_file = Some(dir.path().join("echo.bin"));
    config.io.iterations = 3;

    let report = run_pipeline(&config).await.unwrap();
    assert_eq!(report.bindings.len(), 2);
    assert_eq!(report.batch_size, 1);
    assert_eq!(report.iterations, 3);
    assert!(!report.reused_cached_engine);

    let output = read_f32(&config.io.output_file);
    assert_eq!(output.len(), H * W);
    let expected = 0.25f32.tanh();
    assert!(output.iter().all(|v| v.is_finite() && (v - expected).abs() < 1e-6));

    assert_eq!(fs::read(dir.path().join("echo.bin")).unwrap(), vec![0u8; H * W * 4]);
}

#[tokio::test]
async fn test_missing_model_fails_at_compile() {
    let (_dir, mut config) = setup();
    config.model.file = "absent.json".to_string();

    let err = run_pipeline(&config).await.unwrap_err();
    assert_eq!(err.stage, Stage::Compile);
    assert!(err.source.is_not_found());
    assert!(!config.io.output_file.exists());
}

#[tokio::test]
async fn test_cached_engine_is_reused() {
    let (dir, mut config) = setup();
    config.cache.engine_path = Some(dir.path().join("cache").join("engine.bin"));

    let first = run_pipeline(&config).await.unwrap();
    assert!(!first.reused_cached_engine);
    let first_output = fs::read(&config.io.output_file).unwrap();

    let second = run_pipeline(&config).await.unwrap();
    assert!(second.reused_cached_engine);
    assert_eq!(fs::read(&config.io.output_file).unwrap(), first_output);
}

#[tokio::test]
async fn test_edited_model_invalidates_cache() {
    let (dir, mut config) = setup();
    config.cache.engine_path = Some(dir.path().join("engine.bin"));

    let first = run_pipeline(&config).await.unwrap();
    assert!(!first.reused_cached_engine);
    assert!((read_f32(&config.io.output_file)[0] - 0.25f32.tanh()).abs() < 1e-6);

    write_model(&dir.path().join("models"), "beamformer.json", 1.0, &["prob"]);
    let second = run_pipeline(&config).await.unwrap();
    assert!(!second.reused_cached_engine);
    let output = read_f32(&config.io.output_file);
    assert!(output.iter().all(|v| (v - 1.0f32.tanh()).abs() < 1e-6));

    let third = run_pipeline(&config).await.unwrap();
    assert!(third.reused_cached_engine);
}

#[tokio::test]
async fn test_changed_build_settings_invalidate_cache() {
    let (dir, mut config) = setup();
    config.cache.engine_path = Some(dir.path().join("engine.bin"));
    assert!(!run_pipeline(&config).await.unwrap().reused_cached_engine);

    config.build.workspace_bytes *= 2;
    assert!(!run_pipeline(&config).await.unwrap().reused_cached_engine);
    assert!(run_pipeline(&config).await.unwrap().reused_cached_engine);
}

#[tokio::test]
async fn test_corrupt_cache_is_recompiled() {
    let (dir, mut config) = setup();
    let cache = dir.path().join("engine.bin");
    fs::write(&cache, b"garbage").unwrap();
    config.cache.engine_path = Some(cache.clone());

    let report = run_pipeline(&config).await.unwrap();
    assert!(!report.reused_cached_engine);
    assert_eq!(&fs::read(&cache).unwrap()[..4], b"EPEB");
}

#[tokio::test]
async fn test_two_outputs_violate_binding_contract() {
    let (dir, config) = setup();
    write_model(&dir.path().join("models"), "beamformer.json", 0.25, &["prob", "aux"]);

    let err = run_pipeline(&config).await.unwrap_err();
    assert_eq!(err.stage, Stage::Deserialize);
    assert!(err.source.is_binding_mismatch());
}

#[tokio::test]
async fn test_unwritable_echo_file_fails_at_echo() {
    let (dir, mut config) = setup();
    config.io.echo_file = Some(dir.path().join("models"));

    let err = run_pipeline(&config).await.unwrap_err();
    assert_eq!(err.stage, Stage::EchoInput);
    assert!(err.source.is_io());
    assert!(!config.io.output_file.exists());
}

#[tokio::test]
async fn test_short_input_file_is_rejected() {
    let (dir, config) = setup();
    fs::write(dir.path().join("input.bin"), vec![0u8; 100]).unwrap();

    let err = run_pipeline(&config).await.unwrap_err();
    assert_eq!(err.stage, Stage::ReadInput);
    assert!(err.source.is_io());
}
