//! Event dispatch for the conductor: events in, directives executed,
//! responses and acknowledgments out.

mod bootstrap;
mod client;
mod directive;
mod dispatcher;
mod error;
mod event;
mod gateway;
mod processor;
pub mod prompt;
mod server;
pub mod tool_loop;

pub use bootstrap::{Runtime, registries};
pub use client::GatewayClient;
pub use directive::ActionDirective;
pub use dispatcher::{Dispatcher, DispatcherBuilder, EventState, Handled};
pub use error::DispatchError;
pub use event::{AckStatus, Acknowledgment, Event, OutboundResponse, RESERVED_PREFIXES};
pub use gateway::{ChannelGateway, EventGateway, GatewayMessage};
pub use processor::CapabilityJobProcessor;
pub use server::SocketGateway;
pub use tool_loop::{ToolErrorPolicy, ToolExecution, ToolRound, resolve_tool_call};
