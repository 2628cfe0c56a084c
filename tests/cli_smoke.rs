use std::path::PathBuf;

use image::Rgba;
use layerbrush::Surface;
use layerbrush::io::{read_png, write_png};

#[test]
fn cli_replays_script_and_writes_outputs() {
    let dir = std::env::temp_dir().join(format!("layerbrush-cli-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();

    let input = dir.join("bg.png");
    write_png(&Surface::from_pixel(128, 128, Rgba([255, 0, 0, 255])), &input).unwrap();

    let script = dir.join("script.json");
    std::fs::write(
        &script,
        r#"{
            "adjustments": { "brightness": 0.5 },
            "steps": [
                { "op": "stroke", "tool": "paint", "brush": { "size": 20, "color": [0, 0, 255] },
                  "points": [[10, 64], [118, 64]] },
                { "op": "stroke", "tool": "maskPaint", "brush": { "size": 40, "texture": "square" },
                  "points": [[20, 20]] },
                { "op": "binarizeMask" }
            ]
        }"#,
    )
    .unwrap();

    let out = dir.join("out");
    let exe = PathBuf::from(env!("CARGO_BIN_EXE_layerbrush"));
    let status = std::process::Command::new(exe)
        .arg("--input")
        .arg(&input)
        .arg("--script")
        .arg(&script)
        .arg("--output-dir")
        .arg(&out)
        .arg("--settings")
        .arg(dir.join("no-settings.json"))
        .arg("--no-gpu")
        .env("XDG_DATA_HOME", &dir)
        .status()
        .unwrap();
    assert!(status.success());

    let source = read_png(&out.join("source.png")).unwrap();
    assert_eq!(source.dimensions(), (128, 128));
    let inpaint = read_png(&out.join("inpaint.png")).unwrap();
    assert_eq!(inpaint.get_pixel(20, 20).0, [0, 0, 0, 255]);
    assert_eq!(inpaint.get_pixel(100, 100).0, [255, 255, 255, 255]);
    let display = read_png(&out.join("display.png")).unwrap();
    assert!(display.get_pixel(100, 10).0[0] < 200, "brightness halved");
    assert!(out.join("snapshots").is_dir());

    let _ = std::fs::remove_dir_all(&dir);
}
