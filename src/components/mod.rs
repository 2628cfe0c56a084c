pub mod brush;
pub mod stamp;
pub mod stroke;
