//! Interactive session for gcpvm
//!
//! The [`Session`] owns the registry, the tunnel manager and the gateway
//! handles and drives a menu state machine until the user exits. Input and
//! interrupts come through the [`Prompt`] and [`Interrupt`] traits so that
//! whole sessions can be scripted in tests.

pub mod actions;
pub mod config;
pub mod console;
pub mod interrupt;
pub mod prompt;
pub mod session;
pub mod state;

pub use actions::{
    ForwardMode, MainAction, Menu, MenuItem, ProjectAdminAction, ServiceAction, TunnelAction,
    VmAction,
};
pub use config::SessionConfig;
pub use console::Console;
pub use interrupt::{CtrlC, Interrupt, NotifyInterrupt};
pub use prompt::{Prompt, PromptError, TerminalPrompt};
pub use session::{Session, SessionError};
pub use state::{Activity, Purpose, SessionState, VmRef};
