pub mod callbacks;
pub mod protocol;
pub mod room;
pub mod transport;
pub mod ws_transport;
