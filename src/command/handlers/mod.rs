//! Command handlers for the guest operations
//!
//! Each handler decodes its opcode-specific request view from the envelope,
//! acquires the impersonation gate where guest-OS-protected resources are
//! touched, and returns result bytes or a taxonomy error.

mod account;
mod fs;
mod process;
mod script;
mod vars;

pub use account::check_user_account;
pub use fs::{
    create_directory, create_temp_object, delete_object, get_file_info, list_directory,
    move_object, object_exists,
};
pub use process::{kill_process, list_processes, list_processes_ex, run_program, start_program};
pub use script::run_script;
pub use vars::{read_env_variables, read_variable, write_variable};

use crate::impersonate::{Credential, ImpersonationGate};
use crate::process::{EnvironmentTable, ExitedProcessRegistry, ProcessEngine};
use guestops_shared::wire::{CredentialBlock, Envelope};
use guestops_shared::OpResult;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Context passed to command handlers
#[derive(Clone)]
pub struct HandlerContext {
    pub gate: Arc<ImpersonationGate>,
    pub engine: Arc<ProcessEngine>,
    pub registry: Arc<ExitedProcessRegistry>,
    pub env: Arc<EnvironmentTable>,
    /// Free-form guest variable store, separate from the environment
    pub guest_vars: Arc<RwLock<HashMap<String, String>>>,
    pub agent_pid: u64,
}

/// Decode the credential descriptor appended to the envelope
pub(crate) fn credential(envelope: &Envelope<'_>) -> OpResult<Credential> {
    let block = CredentialBlock::parse(envelope)?;
    Credential::parse(&block)
}
