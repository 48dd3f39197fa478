pub mod cortex;
pub mod fs;
pub mod state;
