// Control center for BCI lab rigs
//
// Clients authenticate with a shared secret, announce a `path,uid`
// identity and go through an echo-based clock sync. Afterwards the hub
// routes JSON letters between them, translating each letter's timestamp
// from the sender's clock to the receiver's.

pub mod error;
pub mod frame;
pub mod letter;
pub mod clock;
pub mod handshake;
pub mod session;
pub mod registry;
pub mod bag;
pub mod router;
pub mod config;
pub mod server;
pub mod client;
pub mod cli;
pub mod commands;

pub use error::{FrameError, HubError, ProtocolError, Result};
pub use frame::{FrameReader, FrameWriter};
pub use letter::{Destination, Letter, Payload, Station};
pub use clock::{ClockState, SyncSettings};
pub use handshake::{ClientIdentity, SharedKey};
pub use session::{Connection, Session, SessionInfo, SessionStatus};
pub use registry::Registry;
pub use bag::{Bag, MailBags, MailMan, Resolution, Slot};
pub use router::{RouteOutcome, Router};
pub use config::{ClientConfig, HubConfig};
pub use server::HubServer;
pub use client::{ClientHandle, HubClient};
pub use cli::{HubCli, HubCommand};
pub use commands::execute_command;
