pub mod connection;
pub mod link_error;
pub mod link_socket;
pub mod observer;
pub mod outbound_queue;
