pub mod config;
pub mod isl;
pub mod jobcenter;
pub mod lrcp;
pub mod speed;
pub mod util;
