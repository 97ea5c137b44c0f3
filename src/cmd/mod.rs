//! Commands sent to the server.
//!
//! A [`Command`] is an ordered list of byte-string arguments, argument 0 being
//! the command name. The per-command structs in this module (`Get`, `Set`,
//! `Subscribe`, ...) only exist to build a `Command` through `into_command`.

mod auth;
pub use auth::{Auth, ClientSetName, Select};

mod get;
pub use get::Get;

mod incr;
pub use incr::Incr;

mod multi;
pub use multi::{Discard, Exec, Multi, Unwatch, Watch};

mod ping;
pub use ping::Ping;

mod publish;
pub use publish::Publish;

mod set;
pub use set::Set;

mod subscribe;
pub use subscribe::{Subscribe, Unsubscribe};

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Command names a connection in subscribed mode still accepts.
const PUBSUB_COMMANDS: &[&[u8]] = &[
    b"SUBSCRIBE",
    b"PSUBSCRIBE",
    b"UNSUBSCRIBE",
    b"PUNSUBSCRIBE",
    b"PING",
    b"QUIT",
];

/// A command: the name followed by its arguments, all binary safe.
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    /// Create a command with no arguments besides its name.
    pub fn new(name: impl AsRef<[u8]>) -> Command {
        Command {
            args: vec![Bytes::copy_from_slice(name.as_ref())],
        }
    }

    /// Build a command from an argument list, `args[0]` being the name.
    ///
    /// Returns `None` when the list is empty.
    pub fn from_args<I, T>(args: I) -> Option<Command>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let args: Vec<Bytes> = args
            .into_iter()
            .map(|arg| Bytes::copy_from_slice(arg.as_ref()))
            .collect();
        if args.is_empty() {
            return None;
        }
        Some(Command { args })
    }

    /// Append an argument, copying it.
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Command {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    /// Append an argument without copying.
    pub fn bulk(mut self, arg: Bytes) -> Command {
        self.args.push(arg);
        self
    }

    /// Append an integer argument in its decimal form.
    pub fn int(mut self, value: i64) -> Command {
        self.args.push(Bytes::from(value.to_string()));
        self
    }

    /// Append several arguments.
    pub fn args<I, T>(mut self, args: I) -> Command
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        self.args
            .extend(args.into_iter().map(|arg| Bytes::copy_from_slice(arg.as_ref())));
        self
    }

    /// Upper-cased command name, for logging and state checks.
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.args[0]).to_ascii_uppercase()
    }

    /// All arguments including the name.
    pub fn parts(&self) -> &[Bytes] {
        &self.args
    }

    /// Whether a subscribed connection may send this command.
    pub(crate) fn is_pubsub_command(&self) -> bool {
        let name = &self.args[0];
        PUBSUB_COMMANDS
            .iter()
            .any(|allowed| name.eq_ignore_ascii_case(allowed))
    }

    /// Serialize as an array of bulk strings into `dst`.
    ///
    /// ```text
    /// *<argc>\r\n$<len>\r\n<arg>\r\n ...
    /// ```
    pub fn encode(&self, dst: &mut BytesMut) {
        let needed: usize = self.args.iter().map(|arg| arg.len() + 16).sum();
        dst.reserve(needed + 16);

        dst.put_u8(b'*');
        write_decimal(dst, self.args.len());
        for arg in &self.args {
            dst.put_u8(b'$');
            write_decimal(dst, arg.len());
            dst.put_slice(arg);
            dst.put_slice(b"\r\n");
        }
    }

    /// Encoded wire bytes of this command.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Write `val` followed by CRLF.
fn write_decimal(dst: &mut BytesMut, val: usize) {
    use std::fmt::Write;

    // BytesMut 的 fmt::Write 实现不会失败
    let _ = write!(dst, "{}\r\n", val);
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for arg in &self.args {
            match std::str::from_utf8(arg) {
                Ok(s) => list.entry(&s),
                Err(_) => list.entry(arg),
            };
        }
        list.finish()
    }
}
