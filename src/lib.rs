pub mod codec;
pub mod config;
pub mod dedupe;
pub mod error;
pub mod file_transfer;
pub mod game;
pub mod group;
pub mod messaging;
pub mod node;
pub mod peer;
pub mod presence;
pub mod router;
pub mod token;
pub mod transport;
pub mod ui;

pub use config::LsnpConfig;
pub use error::LsnpError;
pub use node::LsnpNode;
pub use presence::Identity;
pub use ui::{UiCommand, UiEvent, UiHandle};
