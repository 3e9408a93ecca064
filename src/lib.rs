//! A bidirectional UDP command channel between a local controller and a single fixed remote
//!  device that accepts text commands and replies with text telemetry.
//!
//! The central piece is the [link::connection::ConnectionActor]. It owns one UDP socket and
//!  * keeps a receive loop armed for as long as it is alive, passing every inbound datagram to
//!    a [link::observer::LinkObserver]
//!  * serializes outbound datagrams through an [link::outbound_queue::OutboundQueue] so that
//!    at most one send is in flight at any time, in the order `send` was called
//!
//! There is no reliability layer on top of UDP: no acks, no retransmission, no handshake. The
//!  remote device's own protocol (plain text commands like `takeoff` or `rc 0 0 10 0`) is all
//!  there is.
//!
//! [driver] turns gamepad state into [command::Command]s and feeds them to the actor, and
//!  [gamepad] provides the gamepad input it polls.

pub mod command;
pub mod config;
pub mod driver;
pub mod gamepad;
pub mod link;
pub mod test_util;
