//! Self-describing binary request envelopes
//!
//! Every command arrives as:
//! ```text
//! [ 16 bytes: common header ][ opcode fixed struct ][ variable fields ][ credential block ]
//! ```
//!
//! The common header declares `header_length` (common header plus the opcode
//! fixed struct) and `body_length` (every declared variable field including
//! its terminator). The two must account for the buffer exactly; anything
//! else is a malformed message and produces no field views at all.
//!
//! All field accessors hand out borrowed views into the original buffer.
//! Nothing is copied at decode time.

use crate::error::{OpError, OpResult};
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the fixed common header preceding every request
pub const COMMON_HEADER_LEN: usize = 16;

/// The fixed header shared by all request envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub opcode: u32,
    pub header_length: u32,
    pub body_length: u32,
    pub credential_type: u32,
}

impl CommonHeader {
    fn parse(buf: &[u8]) -> OpResult<Self> {
        if buf.len() < COMMON_HEADER_LEN {
            return Err(OpError::MalformedMessage);
        }
        let u32_at = |off: usize| {
            u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
        };
        Ok(Self {
            opcode: u32_at(0),
            header_length: u32_at(4),
            body_length: u32_at(8),
            credential_type: u32_at(12),
        })
    }
}

/// A validated view over one raw request buffer.
///
/// Construction only checks the outer frame: the declared header and body
/// regions must fit the buffer. Per-opcode decoding then verifies that the
/// declared variable-field lengths consume the body exactly.
#[derive(Debug, Clone, Copy)]
pub struct Envelope<'a> {
    pub header: CommonHeader,
    buf: &'a [u8],
}

impl<'a> Envelope<'a> {
    pub fn parse(buf: &'a [u8]) -> OpResult<Self> {
        let header = CommonHeader::parse(buf)?;
        let header_length = header.header_length as usize;
        let body_length = header.body_length as usize;
        if header_length < COMMON_HEADER_LEN {
            return Err(OpError::MalformedMessage);
        }
        let declared_end = header_length
            .checked_add(body_length)
            .ok_or(OpError::MalformedMessage)?;
        if declared_end > buf.len() {
            return Err(OpError::MalformedMessage);
        }
        Ok(Self { header, buf })
    }

    /// The opcode-specific fixed struct
    pub fn fixed_body(&self) -> &'a [u8] {
        &self.buf[COMMON_HEADER_LEN..self.header.header_length as usize]
    }

    /// The declared variable-length fields
    pub fn var_body(&self) -> &'a [u8] {
        let start = self.header.header_length as usize;
        &self.buf[start..start + self.header.body_length as usize]
    }

    /// Whatever follows the declared body: the credential block
    pub fn credential_bytes(&self) -> &'a [u8] {
        let start = self.header.header_length as usize + self.header.body_length as usize;
        &self.buf[start..]
    }
}

/// Bounds-checked cursor over a body region.
///
/// Every read either succeeds inside the region or fails with
/// `MalformedMessage`; offsets never move past the end.
pub struct BodyReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> OpResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(OpError::MalformedMessage)?;
        if end > self.buf.len() {
            return Err(OpError::MalformedMessage);
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn u32(&mut self) -> OpResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> OpResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn i64(&mut self) -> OpResult<i64> {
        Ok(self.u64()? as i64)
    }

    /// Read a declared-length string field.
    ///
    /// The declared length counts the terminator, so `0` means the field was
    /// omitted entirely (`None`), while `1` is a present-but-empty string
    /// (`Some("")`). The terminator must sit exactly at the declared offset.
    pub fn str_field(&mut self, declared: u32) -> OpResult<Option<&'a str>> {
        if declared == 0 {
            return Ok(None);
        }
        let bytes = self.take(declared as usize)?;
        let (terminator, content) = bytes.split_last().ok_or(OpError::MalformedMessage)?;
        if *terminator != 0 || content.contains(&0) {
            return Err(OpError::MalformedMessage);
        }
        let s = std::str::from_utf8(content).map_err(|_| OpError::MalformedMessage)?;
        Ok(Some(s))
    }

    /// Read a NUL-terminated string of undeclared length (counted-array
    /// entries). The terminator must appear before the region ends.
    pub fn cstr(&mut self) -> OpResult<&'a str> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(OpError::MalformedMessage)?;
        let s = std::str::from_utf8(&rest[..nul]).map_err(|_| OpError::MalformedMessage)?;
        self.pos += nul + 1;
        Ok(s)
    }

    /// Assert the region was consumed exactly. This is what enforces the
    /// `header_length + body_length == sum of declared lengths` invariant.
    pub fn finish(self) -> OpResult<()> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(OpError::MalformedMessage)
        }
    }
}

/// Reject omitted or empty required string fields
pub fn required<'a>(field: Option<&'a str>) -> OpResult<&'a str> {
    match field {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(OpError::InvalidArgument),
    }
}

/// Option bit for RunProgram/RunScript: do not report completion back
pub const RUN_RETURN_IMMEDIATELY: u32 = 0x1;

/// RunProgram: fire-and-report launch of a guest program
#[derive(Debug, PartialEq, Eq)]
pub struct RunProgramRequest<'a> {
    pub options: u32,
    pub program_path: &'a str,
    pub arguments: Option<&'a str>,
}

impl<'a> RunProgramRequest<'a> {
    pub fn decode(env: &Envelope<'a>) -> OpResult<Self> {
        let mut fixed = BodyReader::new(env.fixed_body());
        let options = fixed.u32()?;
        let program_path_length = fixed.u32()?;
        let arguments_length = fixed.u32()?;
        fixed.finish()?;

        let mut var = BodyReader::new(env.var_body());
        let program_path = var.str_field(program_path_length)?;
        let arguments = var.str_field(arguments_length)?;
        var.finish()?;

        Ok(Self {
            options,
            program_path: required(program_path)?,
            arguments,
        })
    }
}

/// StartProgram: tracked launch whose outcome stays queryable
#[derive(Debug, PartialEq, Eq)]
pub struct StartProgramRequest<'a> {
    pub program_path: &'a str,
    pub arguments: Option<&'a str>,
    pub working_dir: Option<&'a str>,
    pub env_vars: Vec<&'a str>,
}

impl<'a> StartProgramRequest<'a> {
    pub fn decode(env: &Envelope<'a>) -> OpResult<Self> {
        let mut fixed = BodyReader::new(env.fixed_body());
        let program_path_length = fixed.u32()?;
        let arguments_length = fixed.u32()?;
        let working_dir_length = fixed.u32()?;
        let num_env_vars = fixed.u32()?;
        fixed.finish()?;

        let mut var = BodyReader::new(env.var_body());
        let program_path = var.str_field(program_path_length)?;
        let arguments = var.str_field(arguments_length)?;
        let working_dir = var.str_field(working_dir_length)?;
        let mut env_vars = Vec::with_capacity(num_env_vars.min(64) as usize);
        for _ in 0..num_env_vars {
            env_vars.push(var.cstr()?);
        }
        var.finish()?;

        Ok(Self {
            program_path: required(program_path)?,
            arguments,
            working_dir,
            env_vars,
        })
    }
}

/// RunScript: write the script to a temp file and run it via an interpreter
#[derive(Debug, PartialEq, Eq)]
pub struct RunScriptRequest<'a> {
    pub options: u32,
    pub interpreter: Option<&'a str>,
    pub properties: Option<&'a str>,
    pub script: &'a str,
}

impl<'a> RunScriptRequest<'a> {
    pub fn decode(env: &Envelope<'a>) -> OpResult<Self> {
        let mut fixed = BodyReader::new(env.fixed_body());
        let options = fixed.u32()?;
        let interpreter_length = fixed.u32()?;
        let properties_length = fixed.u32()?;
        let script_length = fixed.u32()?;
        fixed.finish()?;

        let mut var = BodyReader::new(env.var_body());
        let interpreter = var.str_field(interpreter_length)?;
        let properties = var.str_field(properties_length)?;
        let script = var.str_field(script_length)?;
        var.finish()?;

        Ok(Self {
            options,
            interpreter,
            properties,
            script: script.ok_or(OpError::InvalidArgument)?,
        })
    }
}

/// KillProcess: deliver a fatal signal to a guest process
#[derive(Debug, PartialEq, Eq)]
pub struct KillProcessRequest {
    pub pid: i64,
    pub options: u32,
}

impl KillProcessRequest {
    pub fn decode(env: &Envelope<'_>) -> OpResult<Self> {
        let mut fixed = BodyReader::new(env.fixed_body());
        let pid = fixed.i64()?;
        let options = fixed.u32()?;
        fixed.finish()?;
        BodyReader::new(env.var_body()).finish()?;
        Ok(Self { pid, options })
    }
}

/// ListProcesses / ListProcessesEx: optional pid filter
#[derive(Debug, PartialEq, Eq)]
pub struct ListProcessesRequest {
    pub options: u32,
    pub pids: Vec<u64>,
}

impl ListProcessesRequest {
    pub fn decode(env: &Envelope<'_>) -> OpResult<Self> {
        let mut fixed = BodyReader::new(env.fixed_body());
        let options = fixed.u32()?;
        let num_pids = fixed.u32()?;
        fixed.finish()?;

        let mut var = BodyReader::new(env.var_body());
        let mut pids = Vec::with_capacity(num_pids.min(1024) as usize);
        for _ in 0..num_pids {
            pids.push(var.u64()?);
        }
        var.finish()?;
        Ok(Self { options, pids })
    }
}

/// ReadVariable: fetch one variable from the requested scope
#[derive(Debug, PartialEq, Eq)]
pub struct ReadVariableRequest<'a> {
    pub scope: u32,
    pub name: &'a str,
}

impl<'a> ReadVariableRequest<'a> {
    pub fn decode(env: &Envelope<'a>) -> OpResult<Self> {
        let mut fixed = BodyReader::new(env.fixed_body());
        let scope = fixed.u32()?;
        let name_length = fixed.u32()?;
        fixed.finish()?;

        let mut var = BodyReader::new(env.var_body());
        let name = var.str_field(name_length)?;
        var.finish()?;
        Ok(Self {
            scope,
            name: required(name)?,
        })
    }
}

/// WriteVariable: store one variable in the requested scope
#[derive(Debug, PartialEq, Eq)]
pub struct WriteVariableRequest<'a> {
    pub scope: u32,
    pub name: &'a str,
    pub value: Option<&'a str>,
}

impl<'a> WriteVariableRequest<'a> {
    pub fn decode(env: &Envelope<'a>) -> OpResult<Self> {
        let mut fixed = BodyReader::new(env.fixed_body());
        let scope = fixed.u32()?;
        let name_length = fixed.u32()?;
        let value_length = fixed.u32()?;
        fixed.finish()?;

        let mut var = BodyReader::new(env.var_body());
        let name = var.str_field(name_length)?;
        let value = var.str_field(value_length)?;
        var.finish()?;
        Ok(Self {
            scope,
            name: required(name)?,
            value,
        })
    }
}

/// ReadEnvVariables: zero names means "return the whole table"
#[derive(Debug, PartialEq, Eq)]
pub struct ReadEnvVariablesRequest<'a> {
    pub names: Vec<&'a str>,
}

impl<'a> ReadEnvVariablesRequest<'a> {
    pub fn decode(env: &Envelope<'a>) -> OpResult<Self> {
        let mut fixed = BodyReader::new(env.fixed_body());
        let num_names = fixed.u32()?;
        fixed.finish()?;

        let mut var = BodyReader::new(env.var_body());
        let mut names = Vec::with_capacity(num_names.min(64) as usize);
        for _ in 0..num_names {
            names.push(var.cstr()?);
        }
        var.finish()?;
        Ok(Self { names })
    }
}

/// Single-path filesystem requests (delete, exists, create dir, list, info)
#[derive(Debug, PartialEq, Eq)]
pub struct FilePathRequest<'a> {
    pub options: u32,
    pub path: &'a str,
}

impl<'a> FilePathRequest<'a> {
    pub fn decode(env: &Envelope<'a>) -> OpResult<Self> {
        let mut fixed = BodyReader::new(env.fixed_body());
        let options = fixed.u32()?;
        let path_length = fixed.u32()?;
        fixed.finish()?;

        let mut var = BodyReader::new(env.var_body());
        let path = var.str_field(path_length)?;
        var.finish()?;
        Ok(Self {
            options,
            path: required(path)?,
        })
    }
}

/// Move/rename a file or directory
#[derive(Debug, PartialEq, Eq)]
pub struct MoveObjectRequest<'a> {
    pub options: u32,
    pub source: &'a str,
    pub dest: &'a str,
}

impl<'a> MoveObjectRequest<'a> {
    pub fn decode(env: &Envelope<'a>) -> OpResult<Self> {
        let mut fixed = BodyReader::new(env.fixed_body());
        let options = fixed.u32()?;
        let source_length = fixed.u32()?;
        let dest_length = fixed.u32()?;
        fixed.finish()?;

        let mut var = BodyReader::new(env.var_body());
        let source = var.str_field(source_length)?;
        let dest = var.str_field(dest_length)?;
        var.finish()?;
        Ok(Self {
            options,
            source: required(source)?,
            dest: required(dest)?,
        })
    }
}

/// Create a uniquely named temp file or directory
#[derive(Debug, PartialEq, Eq)]
pub struct CreateTempObjectRequest<'a> {
    pub options: u32,
    pub prefix: Option<&'a str>,
    pub suffix: Option<&'a str>,
    pub parent_dir: Option<&'a str>,
}

impl<'a> CreateTempObjectRequest<'a> {
    pub fn decode(env: &Envelope<'a>) -> OpResult<Self> {
        let mut fixed = BodyReader::new(env.fixed_body());
        let options = fixed.u32()?;
        let prefix_length = fixed.u32()?;
        let suffix_length = fixed.u32()?;
        let parent_dir_length = fixed.u32()?;
        fixed.finish()?;

        let mut var = BodyReader::new(env.var_body());
        let prefix = var.str_field(prefix_length)?;
        let suffix = var.str_field(suffix_length)?;
        let parent_dir = var.str_field(parent_dir_length)?;
        var.finish()?;
        Ok(Self {
            options,
            prefix,
            suffix,
            parent_dir,
        })
    }
}

/// The credential block appended after the declared body.
///
/// `name_length` / `secret_length` describe the de-obfuscated credential so
/// policy checks (such as the empty-secret rejection) can run before the
/// blob is decoded.
#[derive(Debug, PartialEq, Eq)]
pub struct CredentialBlock<'a> {
    pub kind: u32,
    pub name_length: u32,
    pub secret_length: u32,
    pub blob: &'a [u8],
}

impl<'a> CredentialBlock<'a> {
    pub fn parse(env: &Envelope<'a>) -> OpResult<Self> {
        let kind = env.header.credential_type;
        let bytes = env.credential_bytes();
        if bytes.is_empty() {
            return Ok(Self {
                kind,
                name_length: 0,
                secret_length: 0,
                blob: &[],
            });
        }
        let mut rd = BodyReader::new(bytes);
        let name_length = rd.u32()?;
        let secret_length = rd.u32()?;
        let blob_length = rd.u32()?;
        let blob = rd.take(blob_length as usize)?;
        rd.finish()?;
        Ok(Self {
            kind,
            name_length,
            secret_length,
            blob,
        })
    }
}

/// Builds request envelopes. Used by the host-side tooling and by tests;
/// the agent itself only decodes.
#[derive(Debug)]
pub struct EnvelopeBuilder {
    opcode: u32,
    credential_type: u32,
    fixed: BytesMut,
    var: BytesMut,
    cred: BytesMut,
}

impl EnvelopeBuilder {
    pub fn new(opcode: u32, credential_type: u32) -> Self {
        Self {
            opcode,
            credential_type,
            fixed: BytesMut::new(),
            var: BytesMut::new(),
            cred: BytesMut::new(),
        }
    }

    /// Declared length for an optional string field: content plus terminator,
    /// or zero when omitted
    pub fn declared(s: Option<&str>) -> u32 {
        s.map(|s| s.len() as u32 + 1).unwrap_or(0)
    }

    pub fn fixed_u32(mut self, v: u32) -> Self {
        self.fixed.put_u32_le(v);
        self
    }

    pub fn fixed_i64(mut self, v: i64) -> Self {
        self.fixed.put_i64_le(v);
        self
    }

    pub fn var_str(mut self, s: &str) -> Self {
        self.var.put_slice(s.as_bytes());
        self.var.put_u8(0);
        self
    }

    pub fn var_opt_str(self, s: Option<&str>) -> Self {
        match s {
            Some(s) => self.var_str(s),
            None => self,
        }
    }

    pub fn var_u64(mut self, v: u64) -> Self {
        self.var.put_u64_le(v);
        self
    }

    /// Raw body bytes, for crafting deliberately short or unterminated fields
    pub fn var_raw(mut self, bytes: &[u8]) -> Self {
        self.var.put_slice(bytes);
        self
    }

    pub fn credential(mut self, name_length: u32, secret_length: u32, blob: &[u8]) -> Self {
        self.cred.put_u32_le(name_length);
        self.cred.put_u32_le(secret_length);
        self.cred.put_u32_le(blob.len() as u32);
        self.cred.put_slice(blob);
        self
    }

    pub fn finish(self) -> Bytes {
        let header_length = (COMMON_HEADER_LEN + self.fixed.len()) as u32;
        let body_length = self.var.len() as u32;
        let mut out =
            BytesMut::with_capacity(COMMON_HEADER_LEN + self.fixed.len() + self.var.len() + self.cred.len());
        out.put_u32_le(self.opcode);
        out.put_u32_le(header_length);
        out.put_u32_le(body_length);
        out.put_u32_le(self.credential_type);
        out.put_slice(&self.fixed);
        out.put_slice(&self.var);
        out.put_slice(&self.cred);
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{credential_type, Opcode};

    fn run_program_envelope(program: &str, args: Option<&str>) -> Bytes {
        EnvelopeBuilder::new(Opcode::RunProgram as u32, credential_type::SESSION_OWNER)
            .fixed_u32(0)
            .fixed_u32(EnvelopeBuilder::declared(Some(program)))
            .fixed_u32(EnvelopeBuilder::declared(args))
            .var_str(program)
            .var_opt_str(args)
            .finish()
    }

    #[test]
    fn decode_run_program() {
        let buf = run_program_envelope("/bin/ls", Some("-l /tmp"));
        let env = Envelope::parse(&buf).expect("parse failed");
        let req = RunProgramRequest::decode(&env).expect("decode failed");
        assert_eq!(req.program_path, "/bin/ls");
        assert_eq!(req.arguments, Some("-l /tmp"));
    }

    #[test]
    fn absent_and_empty_arguments_are_distinct() {
        let absent = run_program_envelope("/bin/ls", None);
        let env = Envelope::parse(&absent).unwrap();
        let req = RunProgramRequest::decode(&env).unwrap();
        assert_eq!(req.arguments, None);

        let empty = run_program_envelope("/bin/ls", Some(""));
        let env = Envelope::parse(&empty).unwrap();
        let req = RunProgramRequest::decode(&env).unwrap();
        assert_eq!(req.arguments, Some(""));
    }

    #[test]
    fn truncated_variable_field_is_malformed() {
        // Declares a 10-byte field but supplies only 4 bytes of body.
        let buf = EnvelopeBuilder::new(Opcode::RunProgram as u32, 0)
            .fixed_u32(0)
            .fixed_u32(10)
            .fixed_u32(0)
            .var_raw(b"abc\0")
            .finish();
        let env = Envelope::parse(&buf).expect("outer frame is well-formed");
        assert_eq!(
            RunProgramRequest::decode(&env),
            Err(OpError::MalformedMessage)
        );
    }

    #[test]
    fn missing_terminator_is_malformed() {
        let buf = EnvelopeBuilder::new(Opcode::RunProgram as u32, 0)
            .fixed_u32(0)
            .fixed_u32(4)
            .fixed_u32(0)
            .var_raw(b"abcd") // 4 declared bytes, last one is not NUL
            .finish();
        let env = Envelope::parse(&buf).unwrap();
        assert_eq!(
            RunProgramRequest::decode(&env),
            Err(OpError::MalformedMessage)
        );
    }

    #[test]
    fn undeclared_trailing_body_is_malformed() {
        // Body holds one more byte than the declared fields account for.
        let buf = EnvelopeBuilder::new(Opcode::RunProgram as u32, 0)
            .fixed_u32(0)
            .fixed_u32(EnvelopeBuilder::declared(Some("/bin/ls")))
            .fixed_u32(0)
            .var_str("/bin/ls")
            .var_raw(b"x")
            .finish();
        let env = Envelope::parse(&buf).unwrap();
        assert_eq!(
            RunProgramRequest::decode(&env),
            Err(OpError::MalformedMessage)
        );
    }

    #[test]
    fn declared_regions_overrunning_buffer_are_malformed() {
        let buf = run_program_envelope("/bin/ls", None);
        // Lop off the last byte so header_length + body_length > buffer.
        assert_eq!(
            Envelope::parse(&buf[..buf.len() - 1]).unwrap_err(),
            OpError::MalformedMessage
        );
    }

    #[test]
    fn short_header_is_malformed() {
        assert_eq!(
            Envelope::parse(&[0u8; 7]).unwrap_err(),
            OpError::MalformedMessage
        );
    }

    #[test]
    fn empty_required_field_is_invalid_argument() {
        let buf = run_program_envelope("", None);
        let env = Envelope::parse(&buf).unwrap();
        assert_eq!(
            RunProgramRequest::decode(&env),
            Err(OpError::InvalidArgument)
        );
    }

    #[test]
    fn decode_start_program_with_env_vars() {
        let buf = EnvelopeBuilder::new(Opcode::StartProgram as u32, 0)
            .fixed_u32(EnvelopeBuilder::declared(Some("/bin/true")))
            .fixed_u32(EnvelopeBuilder::declared(None))
            .fixed_u32(EnvelopeBuilder::declared(Some("/tmp")))
            .fixed_u32(2)
            .var_str("/bin/true")
            .var_str("/tmp")
            .var_str("A=1")
            .var_str("B=2")
            .finish();
        let env = Envelope::parse(&buf).unwrap();
        let req = StartProgramRequest::decode(&env).unwrap();
        assert_eq!(req.program_path, "/bin/true");
        assert_eq!(req.arguments, None);
        assert_eq!(req.working_dir, Some("/tmp"));
        assert_eq!(req.env_vars, vec!["A=1", "B=2"]);
    }

    #[test]
    fn start_program_env_var_count_mismatch_is_malformed() {
        // Declares three env vars but supplies two.
        let buf = EnvelopeBuilder::new(Opcode::StartProgram as u32, 0)
            .fixed_u32(EnvelopeBuilder::declared(Some("/bin/true")))
            .fixed_u32(0)
            .fixed_u32(0)
            .fixed_u32(3)
            .var_str("/bin/true")
            .var_str("A=1")
            .var_str("B=2")
            .finish();
        let env = Envelope::parse(&buf).unwrap();
        assert_eq!(
            StartProgramRequest::decode(&env),
            Err(OpError::MalformedMessage)
        );
    }

    #[test]
    fn decode_kill_process() {
        let buf = EnvelopeBuilder::new(Opcode::KillProcess as u32, 0)
            .fixed_i64(4242)
            .fixed_u32(0)
            .finish();
        let env = Envelope::parse(&buf).unwrap();
        let req = KillProcessRequest::decode(&env).unwrap();
        assert_eq!(req.pid, 4242);
    }

    #[test]
    fn decode_list_processes_pid_array() {
        let buf = EnvelopeBuilder::new(Opcode::ListProcessesEx as u32, 0)
            .fixed_u32(0)
            .fixed_u32(2)
            .var_u64(10)
            .var_u64(20)
            .finish();
        let env = Envelope::parse(&buf).unwrap();
        let req = ListProcessesRequest::decode(&env).unwrap();
        assert_eq!(req.pids, vec![10, 20]);
    }

    #[test]
    fn credential_block_roundtrip() {
        let buf = EnvelopeBuilder::new(
            Opcode::CheckUserAccount as u32,
            credential_type::NAME_PASSWORD_OBFUSCATED,
        )
        .credential(5, 6, b"YmxvYg==")
        .finish();
        let env = Envelope::parse(&buf).unwrap();
        let cred = CredentialBlock::parse(&env).unwrap();
        assert_eq!(cred.kind, credential_type::NAME_PASSWORD_OBFUSCATED);
        assert_eq!(cred.name_length, 5);
        assert_eq!(cred.secret_length, 6);
        assert_eq!(cred.blob, b"YmxvYg==");
    }

    #[test]
    fn credential_block_with_trailing_garbage_is_malformed() {
        let mut raw = EnvelopeBuilder::new(Opcode::CheckUserAccount as u32, 0)
            .credential(1, 1, b"AA==")
            .finish()
            .to_vec();
        raw.push(0xFF);
        let env = Envelope::parse(&raw).unwrap();
        assert_eq!(
            CredentialBlock::parse(&env),
            Err(OpError::MalformedMessage)
        );
    }
}
