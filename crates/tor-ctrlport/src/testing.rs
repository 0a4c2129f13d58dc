//! Functions to help test this crate.
//!
//! The transport and session tests need something on the far side of a
//! real socket that behaves like tor.  [`ScriptedTor`] is that something:
//! a loopback listener that plays through a fixed sequence of reads and
//! writes, recording the raw bytes of every command it receives so that
//! tests can assert on the exact wire traffic.
//!
//! (A loopback TCP pair stands in for a socketpair here; it behaves the
//! same and works on every platform.)

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener};
use std::thread::{self, JoinHandle};

use crate::conn::{ConnTarget, ControlConn};

/// One step of a scripted conversation, from the tor side.
pub(crate) enum Step {
    /// Read one command (following continuation lines of a multi-line
    /// command up to its terminating `.`) and record its raw bytes.
    Recv,
    /// Write these bytes to the controller.
    Send(&'static str),
}

/// A fake tor process listening on loopback.
///
/// It accepts a single connection, plays through its steps, and then
/// drops the socket.  [`finish`](ScriptedTor::finish) joins the server
/// and returns the raw command bytes it received, in order.
pub(crate) struct ScriptedTor {
    /// The address we are listening on.
    addr: SocketAddr,
    /// The worker playing the script.
    worker: JoinHandle<Vec<String>>,
}

impl ScriptedTor {
    /// Start a scripted server that will play through `steps`.
    pub(crate) fn spawn(steps: Vec<Step>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let worker = thread::spawn(move || {
            let (mut stream, _peer) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut received = Vec::new();
            for step in steps {
                match step {
                    Step::Recv => received.push(read_command(&mut reader)),
                    Step::Send(bytes) => stream.write_all(bytes.as_bytes()).expect("write"),
                }
            }
            received
        });
        Self { addr, worker }
    }

    /// Return a `ConnTarget` pointing at this server.
    pub(crate) fn target(&self) -> ConnTarget {
        ConnTarget::Port(self.addr)
    }

    /// Return an unconnected `ControlConn` pointing at this server.
    pub(crate) fn conn(&self) -> ControlConn {
        ControlConn::new(self.target())
    }

    /// Wait for the script to complete and return the commands received.
    ///
    /// Panics if the server side panicked (e.g. on an unexpected
    /// disconnection mid-script).
    pub(crate) fn finish(self) -> Vec<String> {
        self.worker.join().expect("scripted server panicked")
    }
}

/// Read one command off `reader`, returning its raw bytes.
fn read_command<R: BufRead>(reader: &mut R) -> String {
    let mut command = String::new();
    reader.read_line(&mut command).expect("read command");
    if command.starts_with('+') {
        loop {
            let mut data = String::new();
            reader.read_line(&mut data).expect("read command data");
            command.push_str(&data);
            if data == ".\r\n" {
                break;
            }
        }
    }
    command
}
