pub mod compile;

pub use compile::{compile_stack, CompileOutputs};
