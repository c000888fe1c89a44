//! Calibration pipeline: the iteration driver and the operator-facing hooks
//! it calls (confirmations, plotting, cancellation).

mod cancel;
mod decision;
mod manager;
mod plot;

pub use cancel::*;
pub use decision::*;
pub use manager::*;
pub use plot::*;
