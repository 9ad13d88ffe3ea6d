pub mod async_flag;
pub mod fs;
pub mod logging;
pub mod runnable;
