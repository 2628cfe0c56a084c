//! Layered raster canvas engine: textured brush stamping, pigment-mixed
//! painting, erasing and mask painting on per-object layer stacks, a
//! preview compositor, and a wgpu adjustment stage for display.

pub mod canvas;
pub mod cli;
pub mod components;
pub mod error;
pub mod gpu;
pub mod io;
pub mod logger;
pub mod ops;
pub mod project;
pub mod settings;

pub use canvas::{CompositeRule, DirtyRect, LayerName, LayerStack, Surface};
pub use components::brush::{BrushConfig, TextureKind, TextureLibrary};
pub use components::stroke::{StrokeCompositor, StrokeEnd, StrokeOutcome, ToolMode};
pub use error::{EngineError, EngineResult};
pub use gpu::{AdjustmentStage, DisplaySource, GpuContext, GpuPower, StageState};
pub use io::{DirectoryAdapter, LayerCapture, MemoryAdapter, PersistenceAdapter, SaveQueue, SaveStats};
pub use ops::adjust::Adjustments;
pub use ops::mask::MaskParams;
pub use project::{EditableObject, GenerationPayload, Workspace};
pub use settings::EngineSettings;
