use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn run_foodloc(args: &[&str], current_dir: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_foodloc"))
        .args(args)
        .env("NO_COLOR", "1")
        .env_remove("RUST_LOG")
        .current_dir(current_dir)
        .output()
        .expect("Failed to execute foodloc")
}

fn write_dataset(root: &Path, with_image: bool) {
    std::fs::create_dir_all(root.join("meta")).unwrap();
    std::fs::write(root.join("meta/classes.txt"), "apple_pie\npizza\n").unwrap();
    let pizza = root.join("test/pizza");
    std::fs::create_dir_all(&pizza).unwrap();
    if with_image {
        image::RgbImage::new(400, 600).save(pizza.join("1.png")).unwrap();
    }
}

#[test]
fn test_version_lists_default_ensemble() {
    let temp_dir = TempDir::new().unwrap();
    let output = run_foodloc(&["version"], temp_dir.path());

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(&format!("foodloc v{}", env!("CARGO_PKG_VERSION"))));
    assert!(stdout.contains("Reference kernel: 295"));
    assert!(stdout.contains("vgg16 (kernel 288"));
    assert!(stdout.contains("inception_v3 (kernel 299"));
}

#[test]
fn test_version_reads_ensemble_file() {
    let temp_dir = TempDir::new().unwrap();
    let ensemble = temp_dir.path().join("ensemble.toml");
    std::fs::write(
        &ensemble,
        r#"
reference_kernel = 224

[[members]]
name = "mobilenet"
path = "mobilenet_fcn.onnx"
kernel_size = 224
preprocessing = "tf"
"#,
    )
    .unwrap();

    let output = run_foodloc(
        &["--ensemble", ensemble.to_str().unwrap(), "version"],
        temp_dir.path(),
    );
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Reference kernel: 224"));
    assert!(stdout.contains("mobilenet (kernel 224"));
}

#[test]
fn test_localize_without_class_list_fails() {
    let temp_dir = TempDir::new().unwrap();
    let output = run_foodloc(
        &["localize", temp_dir.path().to_str().unwrap()],
        temp_dir.path(),
    );

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("Failed to read class list"),
        "Error should mention the class list, got: {stderr}"
    );
}

#[test]
fn test_localize_empty_split_writes_empty_list() {
    let temp_dir = TempDir::new().unwrap();
    write_dataset(temp_dir.path(), false);
    let out = temp_dir.path().join("crops.json");

    let output = run_foodloc(
        &[
            "localize",
            temp_dir.path().to_str().unwrap(),
            "--output",
            out.to_str().unwrap(),
        ],
        temp_dir.path(),
    );

    assert!(output.status.success());
    let records: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(records, serde_json::json!([]));
}

#[test]
fn test_localize_with_missing_models_fails() {
    let temp_dir = TempDir::new().unwrap();
    write_dataset(temp_dir.path(), true);

    // The built-in ensemble expects models/ in the working directory
    let output = run_foodloc(
        &["--device", "cpu", "localize", temp_dir.path().to_str().unwrap()],
        temp_dir.path(),
    );

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("does not exist"),
        "Error should mention the missing model, got: {stderr}"
    );
    assert!(stderr.contains("vgg16"));
}

#[test]
fn test_localize_rejects_non_increasing_step() {
    let temp_dir = TempDir::new().unwrap();
    let output = run_foodloc(
        &[
            "localize",
            temp_dir.path().to_str().unwrap(),
            "--upsampling-step",
            "0.9",
        ],
        temp_dir.path(),
    );

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("greater than 1.0"), "got: {stderr}");
}

#[test]
fn test_heatmap_unknown_member_fails() {
    let temp_dir = TempDir::new().unwrap();
    write_dataset(temp_dir.path(), true);
    let image = temp_dir.path().join("test/pizza/1.png");

    let output = run_foodloc(
        &[
            "heatmap",
            image.to_str().unwrap(),
            "--member",
            "resnet50",
            "--label",
            "pizza",
        ],
        temp_dir.path(),
    );

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Unknown ensemble member 'resnet50'"), "got: {stderr}");
}

#[test]
fn test_evaluate_without_crops_fails() {
    let temp_dir = TempDir::new().unwrap();
    write_dataset(temp_dir.path(), false);

    let output = run_foodloc(
        &[
            "evaluate",
            temp_dir.path().to_str().unwrap(),
            "--model",
            "classifier.onnx",
        ],
        temp_dir.path(),
    );

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to read crop records"), "got: {stderr}");
}
