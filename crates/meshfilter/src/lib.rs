pub mod app;
pub mod chain;
pub mod config;
pub mod filter;
pub mod filters;
pub mod stream;
pub mod telemetry;

pub use chain::{FilterChain, Outcome, Stream};
pub use config::Config;
pub use filter::{
	Action, ConnectionInfo, HttpContext, LocalReply, NodeInfo, RequestHeaders, ResponseHeaders,
	RootContext, StreamInfo,
};
pub use stream::StreamHandle;
