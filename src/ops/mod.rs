pub mod adjust;
pub mod mask;
pub mod pigment;
pub mod preview;
