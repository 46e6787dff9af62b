mod session_client;
mod upload_transport;

pub use session_client::*;
pub use upload_transport::*;
