#![doc = include_str!("../README.md")]
#![warn(rustdoc::broken_intra_doc_links)]
pub mod backoff;
pub mod config;
pub mod connector;
pub mod error;
pub mod kvstore;
pub mod protocol;
pub mod route;
pub mod router;
pub mod service;
pub mod sms;
pub mod store;

pub use config::BrokerConfig;
pub use connector::{Connector, ConnectorConfig, ResponseHandler, Sender};
pub use error::{PushgError, Result};
pub use kvstore::{FileKvStore, KvStore, MemoryKvStore};
pub use protocol::{Message, NotificationMessage, Path};
pub use route::{Route, RouteConfig};
pub use router::Router;
pub use service::{Module, Service};
pub use sms::{SmsGateway, SmsGatewayConfig, SmsProvider};
pub use store::{FetchDirection, FetchRequest, FileMessageStore, MessageStore};
