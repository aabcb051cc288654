//! Reverb Client - channel subscriptions and event routing on top of
//! `reverb-socket`.
//!
//! ```no_run
//! use reverb_client::{Handler, ReverbClient};
//! use reverb_core::ReverbConfig;
//!
//! # async fn run() -> reverb_core::ReverbResult<()> {
//! let client = ReverbClient::new(ReverbConfig::new("app-key", "app-secret", "ws.example.com"));
//! client.connect().await?;
//!
//! let orders = client.subscribe("private-orders", None).await?;
//! orders.bind(
//!     "OrderShipped",
//!     Handler::from_fn(|event, data, channel| async move {
//!         println!("{event} on {channel:?}: {data}");
//!         Ok(())
//!     }),
//! );
//!
//! client.listen().await
//! # }
//! ```

pub mod channel;
pub mod client;
pub mod handler;

pub use channel::{Channel, ChannelKind};
pub use client::{ClientEvent, ReverbClient};
pub use handler::{EventHandler, Handler, HandlerMap};
