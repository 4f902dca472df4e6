pub mod circular_buffer;
pub mod codec;
pub mod frame;
pub mod handler;
pub mod health;
pub mod heartbeat;
pub mod reconnect;
pub mod types;

pub use circular_buffer::*;
pub use codec::*;
pub use frame::*;
pub use handler::*;
pub use health::*;
pub use heartbeat::*;
pub use reconnect::*;
pub use types::*;
