mod error;
mod event;
mod transport;
mod upload_task;

pub use error::*;
pub use event::*;
pub use transport::*;
pub use upload_task::*;
