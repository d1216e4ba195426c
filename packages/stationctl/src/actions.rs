pub mod program;
pub mod scan;
