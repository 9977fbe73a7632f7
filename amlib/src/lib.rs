pub mod http;
pub mod io;
pub mod paths;

pub use tokio_util::sync::CancellationToken;
