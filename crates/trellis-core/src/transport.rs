//! Byte-level channel between the host and one sandbox process.
//!
//! Frames are single lines of JSON. The reader thread caps each frame at
//! [`MAX_FRAME_BYTES`] and stops at the first oversized one, so a runaway sandbox cannot
//! make the host buffer unbounded output.

use crate::protocol::SandboxWireMessage;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, ExitStatus};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// How long a closed stdout waits for the process to be reapable before giving up on
/// reporting its exit status.
const EXIT_GRACE: Duration = Duration::from_millis(200);

/// Message channel into one isolated execution context.
pub trait SandboxTransport {
    fn send(&mut self, message: &SandboxWireMessage) -> Result<(), String>;
    fn receive(&mut self, timeout: Duration) -> Result<Option<SandboxWireMessage>, String>;
    fn is_running(&mut self) -> bool;
    fn process_id(&self) -> Option<u32>;
    fn terminate(&mut self);
}

type Frames = Receiver<Result<SandboxWireMessage, String>>;

/// A sandbox child process attached through its stdin/stdout pipes.
pub struct ProcessTransport {
    child: Child,
    stdin: Option<ChildStdin>,
    frames: Frames,
    exit: Option<ExitStatus>,
}

impl ProcessTransport {
    pub fn attach(mut child: Child) -> Result<Self, String> {
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            reap(&mut child);
            return Err("sandbox stdio must be piped".to_string());
        };

        Ok(Self {
            child,
            stdin: Some(stdin),
            frames: read_frames(stdout, MAX_FRAME_BYTES),
            exit: None,
        })
    }

    fn exit_status(&mut self, grace: Duration) -> Option<ExitStatus> {
        if self.exit.is_some() {
            return self.exit;
        }
        let deadline = Instant::now() + grace;
        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.exit = Some(status);
                return self.exit;
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn disconnected(&mut self) -> String {
        match self.exit_status(EXIT_GRACE) {
            Some(status) => format!("sandbox exited ({status})"),
            None => "sandbox closed its stdout".to_string(),
        }
    }
}

impl SandboxTransport for ProcessTransport {
    fn send(&mut self, message: &SandboxWireMessage) -> Result<(), String> {
        let mut frame = serde_json::to_vec(message)
            .map_err(|err| format!("encode {} frame: {err}", message.kind()))?;
        frame.push(b'\n');

        let Some(stdin) = self.stdin.as_mut() else {
            return Err("sandbox stdin already closed".to_string());
        };
        if let Err(err) = stdin.write_all(&frame).and_then(|()| stdin.flush()) {
            self.stdin = None;
            let cause = self.disconnected();
            return Err(format!("write {} frame: {err}; {cause}", message.kind()));
        }
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<SandboxWireMessage>, String> {
        match self.frames.recv_timeout(timeout) {
            Ok(frame) => frame.map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(self.disconnected()),
        }
    }

    fn is_running(&mut self) -> bool {
        self.exit_status(Duration::ZERO).is_none()
    }

    fn process_id(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn terminate(&mut self) {
        self.stdin = None;
        if self.exit.is_none() {
            reap(&mut self.child);
            self.exit = self.child.try_wait().ok().flatten();
        }
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Splits `stdout` into JSON frames on a background thread. Blank lines are skipped;
/// an unparsable frame is reported and reading continues; an oversized frame or a read
/// error ends the stream.
fn read_frames(stdout: impl Read + Send + 'static, max_frame: usize) -> Frames {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut reader = BufReader::new(stdout);
        let mut frame = Vec::new();
        loop {
            frame.clear();
            let limit = max_frame as u64 + 1;
            match (&mut reader).take(limit).read_until(b'\n', &mut frame) {
                Ok(0) => return,
                Ok(_) => {}
                Err(err) => {
                    let _ = tx.send(Err(format!("read sandbox stdout: {err}")));
                    return;
                }
            }
            if frame.len() > max_frame && frame.last() != Some(&b'\n') {
                let _ = tx.send(Err(format!("sandbox frame exceeds {max_frame} bytes")));
                return;
            }

            let text = String::from_utf8_lossy(&frame);
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            let parsed = serde_json::from_str::<SandboxWireMessage>(text)
                .map_err(|err| format!("malformed sandbox frame: {err}"));
            if tx.send(parsed).is_err() {
                return;
            }
        }
    });
    rx
}

fn reap(child: &mut Child) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }
    let _ = child.kill();
    let _ = child.wait();
}
