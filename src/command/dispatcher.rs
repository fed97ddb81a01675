//! Command dispatcher: routes decoded envelopes to their handlers and turns
//! every outcome into a status reply
//!
//! Dispatch never propagates an error to the caller. A malformed envelope, a
//! handler failure and an unrecognized opcode all become a reply frame; only
//! the transport itself can fail past this point.

use super::handlers::{self, HandlerContext};
use guestops_shared::wire::Envelope;
use guestops_shared::{OpError, OpResult, Opcode, OP_OK};
use tracing::{debug, warn};

/// Result bytes of one command.
///
/// Most replies are short fixed answers ("0", "1", the empty result); those
/// come from static storage instead of allocating per request.
#[derive(Debug, PartialEq, Eq)]
pub enum ResultBuf {
    Fixed(&'static [u8]),
    Owned(Vec<u8>),
}

impl ResultBuf {
    pub fn empty() -> Self {
        Self::Fixed(&[])
    }

    pub fn fixed(bytes: &'static [u8]) -> Self {
        Self::Fixed(bytes)
    }

    pub fn text(s: String) -> Self {
        Self::Owned(s.into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Fixed(b) => b,
            Self::Owned(v) => v,
        }
    }
}

/// One reply frame: a status code plus the result bytes
#[derive(Debug, PartialEq, Eq)]
pub struct Reply {
    pub status: u64,
    pub result: ResultBuf,
}

impl Reply {
    fn ok(result: ResultBuf) -> Self {
        Self {
            status: OP_OK,
            result,
        }
    }

    fn error(err: &OpError) -> Self {
        Self {
            status: err.code(),
            result: ResultBuf::empty(),
        }
    }
}

/// Routes raw request envelopes to command handlers
pub struct CommandDispatcher {
    ctx: HandlerContext,
}

impl CommandDispatcher {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }

    /// Dispatch one raw envelope. `request_name` correlates asynchronous
    /// completion notifications with this request.
    pub async fn dispatch(&self, raw: &[u8], request_name: &str) -> Reply {
        let envelope = match Envelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "rejecting unparseable envelope");
                return Reply::error(&err);
            }
        };

        let raw_opcode = envelope.header.opcode;
        let outcome = self.route(&envelope, request_name).await;
        match outcome {
            Ok(result) => Reply::ok(result),
            Err(err) => {
                debug!(opcode = raw_opcode, error = %err, "command failed");
                Reply::error(&err)
            }
        }
    }

    async fn route(
        &self,
        envelope: &Envelope<'_>,
        request_name: &str,
    ) -> OpResult<ResultBuf> {
        use Opcode::*;

        let ctx = &self.ctx;
        let opcode = match Opcode::from_u32(envelope.header.opcode) {
            Some(opcode) => opcode,
            None => {
                // Unlisted opcodes answer with an empty success so an older
                // agent keeps working against a newer controller.
                debug!(
                    opcode = envelope.header.opcode,
                    "unrecognized opcode, answering with empty success"
                );
                return Ok(ResultBuf::empty());
            }
        };
        debug!(?opcode, request = %request_name, "dispatching");

        match opcode {
            CheckUserAccount | Logout => handlers::check_user_account(ctx, envelope).await,
            RunProgram => handlers::run_program(ctx, envelope, request_name).await,
            StartProgram => handlers::start_program(ctx, envelope).await,
            RunScript => handlers::run_script(ctx, envelope, request_name).await,
            KillProcess => handlers::kill_process(ctx, envelope).await,
            ListProcesses => handlers::list_processes(ctx, envelope).await,
            ListProcessesEx => handlers::list_processes_ex(ctx, envelope).await,
            ReadVariable => handlers::read_variable(ctx, envelope).await,
            WriteVariable => handlers::write_variable(ctx, envelope).await,
            ReadEnvVariables => handlers::read_env_variables(ctx, envelope).await,
            DeleteFile | DeleteDirectory => handlers::delete_object(ctx, envelope, opcode).await,
            FileExists | DirectoryExists => handlers::object_exists(ctx, envelope, opcode).await,
            MoveFile | MoveDirectory => handlers::move_object(ctx, envelope, opcode).await,
            CreateDirectory => handlers::create_directory(ctx, envelope).await,
            ListDirectory => handlers::list_directory(ctx, envelope).await,
            GetFileInfo => handlers::get_file_info(ctx, envelope).await,
            CreateTempFile | CreateTempDirectory => {
                handlers::create_temp_object(ctx, envelope, opcode).await
            }
            ForwardSharePacket => Err(OpError::NotSupported),
        }
    }
}
