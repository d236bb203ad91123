//! Settings from a workspace TOML file drive how segments are written.

use crate::common::dense_field;
use segvec::Settings;
use segvec::vector::{VectorFormat, VectorIndex};
use std::fs;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[test]
fn test_toml_settings_control_quantization() {
    let dir = TempDir::new().unwrap();
    let index_path = dir.path().join("idx");
    let config_path = dir.path().join("settings.toml");
    fs::write(
        &config_path,
        format!(
            r#"
index_path = "{}"

[quantization]
min_docs = 4
iterations = 3

[points]
max_points_per_leaf = 2

[search]
parallel_threads = 1
"#,
            index_path.display()
        ),
    )
    .unwrap();

    let settings = Settings::load_from(&config_path).unwrap();
    let format = VectorFormat::from_settings(&settings);
    assert_eq!(format.max_points_per_leaf, 2);
    assert_eq!(format.quantization.as_ref().unwrap().iterations, 3);

    let index = VectorIndex::open(&settings).unwrap();
    let mut writer = index.writer(vec![dense_field("v", 2, 3)]).unwrap();
    for i in 0..9 {
        writer.add_document(&[("v", &[i as f32, 1.0])]).unwrap();
    }
    index.commit(writer, &CancellationToken::new()).unwrap();

    let segments = index.segments();
    let field = segments[0].field("v").unwrap();
    assert_eq!(field.quantized().unwrap().centroid_count(), 3);
    assert!(field.trees()[0].node_count() > 1);
}

#[test]
fn test_disabled_quantization() {
    let mut settings = Settings::default();
    settings.quantization.enabled = false;
    settings.quantization.min_docs = 0;
    assert!(VectorFormat::from_settings(&settings).quantization.is_none());
}
