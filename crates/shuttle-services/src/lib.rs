//! shuttle-services — send record, assembler, retry coordinator, dispatch,
//! and the endpoints that tie them to a transport.

pub mod assembler;
pub mod coordinator;
pub mod dispatch;
pub mod endpoint;
pub mod send_record;
pub mod stats;
pub mod transport;

pub use assembler::{Assembler, AssemblerSettings, Assembly};
pub use coordinator::{Delivered, RetryCoordinator, RetryPolicy, SendError};
pub use dispatch::{Dispatcher, Inbound};
pub use endpoint::Endpoint;
pub use send_record::SendRecord;
pub use stats::{EndpointStats, StatsSnapshot};
pub use transport::{loopback_pair, LoopbackTransport, RawTransport, TransportError};
