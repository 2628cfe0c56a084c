use std::sync::Arc;

use image::Rgba;
use layerbrush::io::{DirectoryAdapter, decode_layer, encode_layer};
use layerbrush::{
    BrushConfig, EngineSettings, LayerName, MemoryAdapter, PersistenceAdapter, StrokeEnd, Surface, TextureKind,
    ToolMode, Workspace,
};

fn temp_dir(tag: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("layerbrush-{}-{}", tag, uuid::Uuid::new_v4()))
}

fn paint_dab(ws: &mut Workspace, id: uuid::Uuid, at: (f32, f32)) {
    ws.pointer_down(id, at).unwrap();
    ws.pointer_up(id, StrokeEnd::Release).unwrap();
}

#[test]
fn partially_painted_layers_round_trip() {
    let mut ws = Workspace::new(EngineSettings { gpu_enabled: false, save_queue: false, ..Default::default() });
    let bg = Surface::from_fn(48, 32, |x, y| Rgba([x as u8 * 5, y as u8 * 7, 90, 255]));
    let id = ws.create_object(bg).unwrap();
    ws.set_brush(BrushConfig { size: 12.0, color: [250, 200, 10], opacity: 0.7, ..Default::default() }).unwrap();
    paint_dab(&mut ws, id, (12.0, 12.0));
    ws.object_mut(id).unwrap().set_tool(ToolMode::MaskPaint);
    ws.set_brush(BrushConfig { size: 9.0, texture: TextureKind::Round, ..Default::default() }).unwrap();
    paint_dab(&mut ws, id, (36.0, 20.0));

    let obj = ws.object(id).unwrap();
    for name in LayerName::PERSISTED {
        let original = obj.layers().layer(name);
        let encoded = encode_layer(name, original).unwrap();
        let (decoded_name, decoded) = decode_layer(&encoded.bytes).unwrap();
        assert_eq!(decoded_name, name);
        assert_eq!(&decoded, original, "layer {name} must be byte-identical");
    }
}

#[test]
fn queued_saves_reach_disk_and_reload() {
    let root = temp_dir("queue");
    let adapter = Arc::new(DirectoryAdapter::new(&root));
    let mut ws = Workspace::new(EngineSettings { gpu_enabled: false, save_queue: true, ..Default::default() });
    ws.set_persistence(adapter.clone()).unwrap();

    let id = ws.create_object(Surface::from_pixel(20, 20, Rgba([0, 128, 0, 255]))).unwrap();
    for i in 0..5 {
        paint_dab(&mut ws, id, (4.0 + i as f32 * 3.0, 10.0));
    }
    ws.flush();
    let painted = ws.object(id).unwrap().layers().layer(LayerName::PermanentStrokes).clone();

    ws.remove_object(id);
    ws.load_object(id).unwrap();
    assert_eq!(ws.object(id).unwrap().layers().layer(LayerName::PermanentStrokes), &painted);
    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn inline_saves_happen_once_per_commit() {
    let adapter = Arc::new(MemoryAdapter::new());
    let mut ws = Workspace::new(EngineSettings { gpu_enabled: false, save_queue: false, ..Default::default() });
    ws.set_persistence(adapter.clone()).unwrap();
    let id = ws.create_object(Surface::from_pixel(16, 16, Rgba([255, 255, 255, 255]))).unwrap();

    paint_dab(&mut ws, id, (8.0, 8.0));
    paint_dab(&mut ws, id, (4.0, 4.0));
    assert_eq!(adapter.save_count(), 2);

    // A cancelled mask dab is rolled back and not persisted.
    ws.object_mut(id).unwrap().set_tool(ToolMode::MaskPaint);
    ws.pointer_down(id, (8.0, 8.0)).unwrap();
    let out = ws.pointer_up(id, StrokeEnd::Cancel).unwrap().unwrap();
    assert!(!out.committed);
    assert_eq!(adapter.save_count(), 2);
    assert!(ws.object(id).unwrap().layers().layer(LayerName::Mask).pixels().all(|p| p.0[3] == 255));

    assert_eq!(adapter.load(id).unwrap().len(), LayerName::PERSISTED.len());
}
