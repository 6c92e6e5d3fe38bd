pub mod histogram;
pub mod logging;
pub mod time;
