#![doc = include_str!("../README.md")]

mod bus;
pub mod config;
pub mod error;
mod forwarder;
pub mod handler;
pub mod hook;
mod message;
pub mod propagation;
mod publisher;
pub mod retry;
pub mod store;
mod subscriber;

#[doc(inline)]
pub use bus::{Bus, ShutdownError};

#[doc(inline)]
pub use config::{BusConfig, ConfigError};

#[doc(inline)]
pub use error::{BusError, BusErrorKind};

#[doc(inline)]
pub use forwarder::OutboxEnvelope;

#[doc(inline)]
pub use handler::{Handler, handler_fn};

#[doc(inline)]
pub use hook::{BusHook, DefaultBusHook};

#[doc(inline)]
pub use message::{Message, Metadata};

#[doc(inline)]
pub use propagation::Propagation;

#[doc(inline)]
pub use publisher::Publisher;

#[doc(inline)]
pub use retry::{RetryError, RetryPolicy};

#[doc(inline)]
pub use subscriber::{Delivery, Group, HandlerError};
