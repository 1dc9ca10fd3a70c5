//! Debug Adapter Protocol surface: message envelopes, Content-Length transport,
//! serialized output channel and the request dispatcher.

mod logger;
pub mod output;
pub mod protocol;
pub mod session;
pub mod tracer;
pub mod transport;

pub use logger::DapLogger;
pub use output::OutputChannel;
pub use session::{DebugSession, RuntimeConnector};
pub use tracer::FileTracer;
pub use transport::{DapReader, DapTransport, DapWriter, StreamTransport};
