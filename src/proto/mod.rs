//! The connection-and-room engine: per-connection state, room
//! membership, the sharded registry and the server pipeline.

mod bucket;
mod channel;
mod conn_tcp;
mod conn_ws;
mod room;
mod server;

pub use self::bucket::Bucket;
pub use self::channel::{Channel, Signal};
pub use self::conn_tcp::init_tcp;
pub use self::conn_ws::init_ws;
pub use self::room::Room;
pub use self::server::Server;
