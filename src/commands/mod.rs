pub mod converge;
pub mod state;
