pub mod board;
pub mod gate;
pub mod model;
pub mod reducer;

pub use board::*;
pub use gate::*;
pub use model::*;
pub use reducer::*;
