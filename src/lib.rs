//! A gRPC-compatible framed RPC runtime that speaks the same call
//! semantics (unary, client-streaming, server-streaming, duplex) over a
//! plain length-delimited frame protocol instead of HTTP/2.
//!
//! ```rust,no_run
//! use framed_rpc::config::ConnectionOptions;
//! use framed_rpc::client::CallInvoker;
//! use framed_rpc::marshal::identity_marshaller;
//! use framed_rpc::multiplexer::spawn;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stream = tokio::net::TcpStream::connect("127.0.0.1:7000").await?;
//!     let conn = spawn(stream, ConnectionOptions::default(), true, None);
//!     let invoker = CallInvoker::new(conn.connection.clone());
//!
//!     let marshaller = identity_marshaller();
//!     let response = invoker
//!         .unary("/greeter/hello", &marshaller, &marshaller, b"world".to_vec())
//!         .await?;
//!     println!("{}", String::from_utf8_lossy(&response));
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod marshal;
pub mod multiplexer;
pub mod pool;
pub mod server;
pub mod status;
pub mod stream;
pub mod transport;
pub mod writer;

pub use error::{Error, Result};
