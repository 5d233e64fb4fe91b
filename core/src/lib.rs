pub mod accumulator;
pub mod config;
pub mod consumer;
pub mod driver;
pub mod errors;
pub mod message;
pub mod pipeline;
pub mod telemetry;

pub use config::{ConsumerConfig, RabbitConfig, ServiceConfig, load_config};
pub use consumer::{Consumer, ConsumerBuilder};
pub use driver::{Driver, MemoryDriver, RabbitDriver};
pub use errors::{ConsumerError, Result};
pub use message::{DeliveryHandle, MessageStatus, RawMessage, StatusRecord};
pub use pipeline::{ErrorContext, FlushReport};
