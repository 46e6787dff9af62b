mod upload_manager;

pub use upload_manager::*;
