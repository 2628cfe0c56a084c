// ============================================================================
// layerbrush CLI: headless replay of stroke scripts
// ============================================================================
//
// Usage examples:
//   layerbrush --input photo.png --script strokes.json --output-dir out/
//   layerbrush -i photo.png -s mask.json -o out/ --no-gpu --verbose
//
// A script is JSON:
//   {
//     "adjustments": { "contrast": 1.2 },
//     "textures": [ { "name": "leaf", "path": "leaf.png" } ],
//     "steps": [
//       { "op": "stroke", "tool": "paint", "brush": { "size": 50, "color": [0, 0, 255] },
//         "points": [[10, 256], [500, 256]] },
//       { "op": "stroke", "tool": "maskPaint", "brush": { "size": 141.5, "texture": "square" },
//         "points": [[50, 50]] },
//       { "op": "binarizeMask" }
//     ]
//   }
//
// Outputs written to the output directory:
//   source.png    background + committed paint, opaque
//   inpaint.png   derived inpaint mask (only when the mask carries an edit)
//   display.png   preview with adjustments applied
//   snapshots/    persisted layers per object

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};

use crate::canvas::LayerName;
use crate::components::brush::BrushConfig;
use crate::components::stroke::{StrokeEnd, ToolMode};
use crate::error::{EngineError, EngineResult};
use crate::io::{DirectoryAdapter, read_png, write_png};
use crate::logger::{self, LogOptions};
use crate::ops::adjust::Adjustments;
use crate::project::Workspace;
use crate::settings::EngineSettings;

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// layerbrush headless stroke replayer.
#[derive(Parser, Debug)]
#[command(
    name = "layerbrush",
    version,
    about = "Replay brush, eraser and mask strokes against an image without a UI"
)]
pub struct CliArgs {
    /// Background image (PNG).
    #[arg(short, long, value_name = "FILE")]
    pub input: PathBuf,

    /// JSON stroke script. Without one the background is only flattened and
    /// re-exported.
    #[arg(short, long, value_name = "SCRIPT.json")]
    pub script: Option<PathBuf>,

    /// Directory for the exported images and snapshots.
    #[arg(short, long, default_value = "layerbrush-out", value_name = "DIR")]
    pub output_dir: PathBuf,

    /// Settings file to use instead of the per-user one.
    #[arg(long, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Skip the GPU and apply adjustments on the CPU.
    #[arg(long)]
    pub no_gpu: bool,

    /// Log filter, e.g. `debug` or `layerbrush=trace`. Overrides settings.
    #[arg(long, value_name = "FILTER")]
    pub log_level: Option<String>,

    /// Mirror the session log to stderr and print per-step timing.
    #[arg(short, long)]
    pub verbose: bool,
}

// ============================================================================
// Script format
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Script {
    pub adjustments: Adjustments,
    pub textures: Vec<TextureEntry>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
pub struct TextureEntry {
    pub name: String,
    /// Relative paths resolve against the script's directory.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Step {
    #[serde(rename_all = "camelCase")]
    Stroke {
        #[serde(default)]
        tool: ToolMode,
        #[serde(default)]
        brush: Option<BrushConfig>,
        points: Vec<[f32; 2]>,
        /// End with a cancel instead of a release.
        #[serde(default)]
        cancel: bool,
    },
    BinarizeMask,
    Clear { layer: LayerName },
    Resize { width: u32, height: u32 },
}

impl Script {
    pub fn load(path: &Path) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let script: Script = serde_json::from_str(&text)?;
        Ok(script)
    }
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run the replay and return an OS exit code.
pub fn run(args: CliArgs) -> ExitCode {
    let settings = match &args.settings {
        Some(path) => match EngineSettings::load_from(path) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("error: could not read settings '{}': {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => EngineSettings::load(),
    };

    logger::init(&LogOptions {
        level: args.log_level.clone().unwrap_or_else(|| settings.log_level.clone()),
        stderr: args.verbose,
        file: None,
    });

    let start = Instant::now();
    match replay(&args, settings) {
        Ok(summary) => {
            println!(
                "{} stroke(s), {} stamp(s) → {} ({:.0}ms)",
                summary.strokes,
                summary.stamps,
                args.output_dir.display(),
                start.elapsed().as_secs_f64() * 1000.0
            );
            if !summary.inpaint_written {
                println!("  mask carries no edit, inpaint.png not written");
            }
            if summary.saves_failed > 0 {
                println!("  {} snapshot save(s) failed, see the log", summary.saves_failed);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            if e.is_user_notice() {
                eprintln!("notice: {}", e);
            } else {
                eprintln!("error: {}", e);
            }
            if let Some(path) = logger::log_path() {
                eprintln!("  see {}", path.display());
            }
            ExitCode::FAILURE
        }
    }
}

#[derive(Debug, Default)]
struct ReplaySummary {
    strokes: usize,
    stamps: usize,
    inpaint_written: bool,
    saves_failed: usize,
}

// ============================================================================
// Replay pipeline
// ============================================================================

fn replay(args: &CliArgs, mut settings: EngineSettings) -> EngineResult<ReplaySummary> {
    // -- Step 1: Load ----------------------------------------------------
    let script = match &args.script {
        Some(path) => Script::load(path)
            .map_err(|e| EngineError::validation(format!("script '{}': {}", path.display(), e)))?,
        None => Script::default(),
    };
    let background = read_png(&args.input)?;
    std::fs::create_dir_all(&args.output_dir)?;

    if args.no_gpu {
        settings.gpu_enabled = false;
    }
    let mut ws = Workspace::new(settings);
    ws.set_persistence(Arc::new(DirectoryAdapter::new(args.output_dir.join("snapshots"))))?;
    ws.init_gpu();

    let script_dir = args
        .script
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_default();
    for tex in &script.textures {
        let path = script_dir.join(&tex.path);
        let bytes = std::fs::read(&path)?;
        ws.library_mut().register_png(&tex.name, &bytes)?;
    }

    let id = ws.create_object(background)?;
    if let Some(obj) = ws.object_mut(id) {
        obj.set_adjustments(script.adjustments)?;
    }

    // -- Step 2: Replay --------------------------------------------------
    let mut summary = ReplaySummary::default();
    for (idx, step) in script.steps.iter().enumerate() {
        let step_start = Instant::now();
        match step {
            Step::Stroke { tool, brush, points, cancel } => {
                let Some((first, rest)) = points.split_first() else {
                    warn!(step = idx, "stroke without points skipped");
                    continue;
                };
                if let Some(brush) = brush {
                    ws.set_brush(brush.clone())?;
                }
                if let Some(obj) = ws.object_mut(id) {
                    obj.set_tool(*tool);
                }
                ws.pointer_down(id, (first[0], first[1]))?;
                for p in rest {
                    ws.pointer_move(id, (p[0], p[1]))?;
                }
                let how = if *cancel { StrokeEnd::Cancel } else { StrokeEnd::Release };
                if let Some(outcome) = ws.pointer_up(id, how)? {
                    summary.strokes += 1;
                    summary.stamps += outcome.stamps;
                }
            }
            Step::BinarizeMask => {
                if let Some(obj) = ws.object_mut(id) {
                    obj.binarize_mask()?;
                }
                ws.persist(id)?;
            }
            Step::Clear { layer } => {
                if let Some(obj) = ws.object_mut(id) {
                    obj.clear_layer(*layer)?;
                }
                ws.persist(id)?;
            }
            Step::Resize { width, height } => {
                if let Some(obj) = ws.object_mut(id) {
                    obj.resize(*width, *height)?;
                }
                ws.persist(id)?;
            }
        }
        if args.verbose {
            println!("  [{}] {} ({:.1}ms)", idx + 1, step_label(step), step_start.elapsed().as_secs_f64() * 1000.0);
        }
    }

    // -- Step 3: Export --------------------------------------------------
    let payload = ws.generation_payload(id)?;
    write_png(&payload.source, &args.output_dir.join("source.png"))?;
    if let Some(mask) = &payload.inpaint_mask {
        write_png(mask, &args.output_dir.join("inpaint.png"))?;
        summary.inpaint_written = true;
    }
    if let Some(obj) = ws.object_mut(id) {
        let display = obj.export_display()?;
        write_png(&display, &args.output_dir.join("display.png"))?;
    }
    ws.flush();
    if let Some(stats) = ws.save_stats() {
        info!(
            enqueued = stats.enqueued,
            coalesced = stats.coalesced,
            saved = stats.saved,
            failed = stats.failed,
            "snapshot saves drained"
        );
        summary.saves_failed = stats.failed;
    }

    info!(
        object = %id,
        strokes = summary.strokes,
        stamps = summary.stamps,
        out = %args.output_dir.display(),
        "replay finished"
    );
    Ok(summary)
}

fn step_label(step: &Step) -> &'static str {
    match step {
        Step::Stroke { tool, .. } => tool.label(),
        Step::BinarizeMask => "binarize mask",
        Step::Clear { .. } => "clear layer",
        Step::Resize { .. } => "resize",
    }
}
