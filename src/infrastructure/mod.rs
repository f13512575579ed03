pub mod device;
pub mod logging;
