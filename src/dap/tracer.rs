use anyhow::Context;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Copy of the DAP traffic in a file, one message per line tagged with its direction.
///
/// Reader and writer halves of a transport share one tracer.
#[derive(Clone)]
pub struct FileTracer {
    out: Arc<Mutex<BufWriter<File>>>,
}

impl FileTracer {
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open trace file {}", path.display()))?;
        Ok(Self {
            out: Arc::new(Mutex::new(BufWriter::new(file))),
        })
    }

    /// Message received from a client.
    pub fn incoming(&self, message: &Value) {
        self.write("<-", message)
    }

    /// Message sent to a client.
    pub fn outgoing(&self, message: &Value) {
        self.write("->", message)
    }

    fn write(&self, direction: &str, message: &Value) {
        // tracing never breaks a session
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "{direction} {message}").and_then(|_| out.flush());
        }
    }
}
