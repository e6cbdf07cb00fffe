use std::fs;

use anyhow::Result;
use candle_core::{DType, Device};
use performer_attention::{AttentionConfig, AttentionError, KernelType, PerformerAttention};

#[test]
fn loads_toml_and_json_documents() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let toml_path = dir.path().join("attention.toml");
    fs::write(
        &toml_path,
        r#"
num_heads = 4
d_model = 32
kernel_type = "cosh"
causal = true
feature_redraw_interval = 25
short_sequence_behavior = "use_softmax_eval_and_train"
"#,
    )?;
    let config = AttentionConfig::from_path(&toml_path)?;
    assert_eq!(config.kernel_type, KernelType::Cosh);
    let resolved = config.resolve()?;
    assert_eq!(resolved.head_dim, 8);
    assert!(resolved.causal);
    assert_eq!(resolved.fallback.name(), "use_softmax_eval_and_train");

    let json_path = dir.path().join("attention.json");
    fs::write(
        &json_path,
        r#"{"num_heads": 2, "d_model": 8, "kernel_type": "relu", "seed": 9}"#,
    )?;
    let config = AttentionConfig::from_path(&json_path)?;
    let attention = PerformerAttention::new(&config, &Device::Cpu, DType::F32)?;
    assert_eq!(attention.config().fallback.name(), "never_use_softmax");
    Ok(())
}

#[test]
fn rejects_unknown_formats_and_fields() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let yaml_path = dir.path().join("attention.yaml");
    fs::write(&yaml_path, "num_heads: 2\n")?;
    assert!(matches!(
        AttentionConfig::from_path(&yaml_path),
        Err(AttentionError::ConfigFormat(_))
    ));

    let typo_path = dir.path().join("typo.toml");
    fs::write(&typo_path, "num_heads = 2\nd_model = 8\nnum_head = 3\n")?;
    assert!(matches!(
        AttentionConfig::from_path(&typo_path),
        Err(AttentionError::ConfigFormat(_))
    ));

    let invalid_path = dir.path().join("invalid.json");
    fs::write(
        &invalid_path,
        r#"{"num_heads": 3, "d_model": 8, "kernel_type": "relu", "short_sequence_behavior": "use_softmax_eval_only"}"#,
    )?;
    assert!(matches!(
        AttentionConfig::from_path(&invalid_path),
        Err(AttentionError::InvalidConfig(_))
    ));

    assert!(matches!(
        AttentionConfig::from_path(dir.path().join("missing.toml")),
        Err(AttentionError::Io(_))
    ));
    Ok(())
}
