//! Chrome trace_event output for `enable_tracing`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::Instant;

pub struct Trace {
    start: Instant,
    w: BufWriter<File>,
    count: usize,
}

impl Trace {
    pub fn open(path: &str) -> std::io::Result<Trace> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "[")?;
        Ok(Trace {
            start: Instant::now(),
            w,
            count: 0,
        })
    }

    /// Record one complete event; name is typically a key description.
    pub fn write_complete(&mut self, name: &str, tid: usize, start: Instant, end: Instant) {
        // Ignore write errors mid-build; the file is best-effort diagnostics.
        let _ = write!(
            self.w,
            "{}{{ \"pid\": 0, \"tid\": {}, \"name\": {:?}, \"ph\": \"X\", \"ts\": {}, \"dur\": {} }}",
            if self.count > 0 { ",\n" } else { "" },
            tid,
            name,
            start.duration_since(self.start).as_micros(),
            end.duration_since(start).as_micros(),
        );
        self.count += 1;
    }

    fn close(&mut self) -> std::io::Result<()> {
        let end = Instant::now();
        self.write_complete("build", 0, self.start, end);
        writeln!(self.w, "\n]")?;
        self.w.flush()
    }
}

impl Drop for Trace {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
