//! Pure numeric components.

pub mod normal_curve;
pub mod scale;
