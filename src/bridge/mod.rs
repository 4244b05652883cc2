//! # Bridge Module
//!
//! Projects an observable vehicle model onto MQTT topics and turns writes on
//! the `_writetopic` topics back into model mutations.
//!
//! ## Module Architecture
//!
//! ```text
//! bridge/
//! ├── codec.rs       - Model values to payloads and back
//! ├── topics.rs      - Path/topic mapping and the topic filter
//! ├── catalog.rs     - Readable/writable topic sets with dirty tracking
//! ├── engine.rs      - Engine state, model events, reconnect replay
//! ├── inbound.rs     - Routing of broker messages
//! ├── error.rs       - Error codes reported on the error topics
//! ├── observers.rs   - External connect/disconnect/subscribe/message hooks
//! └── supervisor.rs  - Lifecycle of the network and flush tasks
//! ```
//!
//! ## Data Flow
//!
//! ```text
//!            ValueChanged / Enabled / Disabled
//!   Model ─────────────────────────────────────► BridgeEngine ──► BrokerClient
//!     ▲                                              │  ▲
//!     └──── set_value / invoke / refresh_all ────────┘  └── BrokerCallbacks
//! ```

pub mod catalog;
pub mod codec;
pub mod engine;
pub mod error;
pub mod inbound;
pub mod observers;
pub mod supervisor;
pub mod topics;

pub use catalog::{CatalogSnapshot, TopicCatalog};
pub use codec::{CodecError, CodecOptions, ImageFormat, ImageRenderer, Payload, ValueCodec};
pub use engine::{BridgeEngine, BridgeSettings, EngineState};
pub use error::BridgeErrorCode;
pub use observers::{BridgeObservers, CallbackId, CallbackList};
pub use supervisor::{Configured, Running, Stopped, Supervisor, SupervisorState};
pub use topics::{InboundAddress, TopicFormat, TopicNamer};
