pub mod apply;
pub mod executor;
pub mod tx;
pub mod validation;
