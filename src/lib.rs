//! SonicNet mesh core: packet model, packet manager, transports, and the
//! node coordinator that ties them together.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod manager;
pub mod packet;
pub mod priority_queue;
pub mod topology;
pub mod transport;
pub mod uploader;

pub use config::Config;
pub use coordinator::{Coordinator, NodeEvent, NodeStatus};
pub use packet::{GpsLocation, MediaAttachment, Packet, PacketType, Urgency};
