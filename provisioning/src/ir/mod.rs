pub mod dag;
pub mod lifecycle;
pub mod outputs;
pub mod resource;

pub use dag::*;
pub use lifecycle::*;
pub use outputs::*;
pub use resource::*;
