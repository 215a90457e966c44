pub mod evaluation;
pub mod review;
pub mod tenant;
pub mod trace;
